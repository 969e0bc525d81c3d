use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use serde::Deserialize;
use tracing::debug;

use crate::error::PoolError;
use crate::frame::DeviceResult;
use crate::output::{OutputSink, Severity};
use crate::proto::pool::{
    Feedback, JobReply, format_job_request, format_result, is_outdated, parse_job_reply,
};
use crate::retry::{Attempt, Outcome, RetryPolicy};

/// Wait between directory lookups that did not yield a node.
pub const DIRECTORY_BACKOFF: Duration = Duration::from_secs(15);
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

const VERSION_LIMIT: usize = 6;
const MOTD_LIMIT: usize = 1024;
const JOB_LIMIT: usize = 128;
const FEEDBACK_LIMIT: usize = 64;

/// A pool node to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl Endpoint {
    /// Parses `host:port` as given on the command line.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("pool must be host:port, got {s:?}"))?;
        let port = port
            .parse::<u16>()
            .with_context(|| format!("bad pool port in {s:?}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            name: s.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Body returned by the pool directory service.
#[derive(Debug, Deserialize)]
pub struct DirectoryReply {
    #[serde(default)]
    pub success: bool,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub message: Option<String>,
}

impl DirectoryReply {
    pub fn into_endpoint(self) -> anyhow::Result<Endpoint> {
        if !self.success {
            return Err(match self.message {
                Some(msg) => anyhow!("directory says: {msg}"),
                None => anyhow!("no response - IP ban or connection error"),
            });
        }
        match (self.ip, self.port) {
            (Some(host), Some(port)) => Ok(Endpoint {
                name: self.name.unwrap_or_else(|| host.clone()),
                host,
                port,
            }),
            _ => Err(anyhow!("directory reply lacks ip/port")),
        }
    }
}

fn lookup(client: &reqwest::blocking::Client, url: &str) -> anyhow::Result<Endpoint> {
    let reply: DirectoryReply = client
        .get(url)
        .send()
        .context("directory request")?
        .json()
        .context("directory reply is not valid JSON")?;
    reply.into_endpoint()
}

/// Asks the directory for the least-loaded node, retrying every 15 s until it answers.
pub fn fetch_endpoint(url: &str, sink: &dyn OutputSink) -> Endpoint {
    let client = match reqwest::blocking::Client::builder()
        .timeout(DIRECTORY_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("http client setup failed, using defaults: {e}");
            reqwest::blocking::Client::new()
        }
    };
    let policy = RetryPolicy::forever(DIRECTORY_BACKOFF);
    loop {
        sink.pretty_print("net0", "Searching for the fastest node", Severity::Info);
        let outcome = policy.run(
            |_| match lookup(&client, url) {
                Ok(endpoint) => Attempt::Done(endpoint),
                Err(e) => Attempt::Retry(e),
            },
            |e, n| {
                sink.pretty_print(
                    "net0",
                    &format!("Node picker unavailable, retrying in 15s ({e:#})"),
                    Severity::Warning,
                );
                debug!(attempt = n, "directory lookup failed: {e:#}");
            },
        );
        if let Outcome::Success(endpoint) = outcome {
            sink.pretty_print(
                "net0",
                &format!("Connecting to node {}", endpoint.name),
                Severity::Info,
            );
            return endpoint;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaking,
    Ready,
    JobRequested,
    JobReceived,
    ResultSubmitted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub server_version: String,
    pub outdated: bool,
    pub motd: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub feedback: Feedback,
    pub ping: Duration,
}

/// One TCP session with a pool node.
pub struct PoolConnection {
    stream: Option<TcpStream>,
    state: SessionState,
    timeout: Duration,
}

impl PoolConnection {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stream: None,
            state: SessionState::Disconnected,
            timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<(), PoolError> {
        self.disconnect();
        let addrs = (endpoint.host.as_str(), endpoint.port).to_socket_addrs()?;
        let mut last = io::Error::new(io::ErrorKind::NotFound, "no address for pool host");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    stream.set_nodelay(true)?;
                    debug!(%endpoint, "pool socket open");
                    self.stream = Some(stream);
                    self.state = SessionState::Connected;
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(PoolError::Connection(last))
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.state = SessionState::Disconnected;
    }

    /// Reads the pool's version and optionally its message of the day.
    pub fn handshake(&mut self, local_version: &str, with_motd: bool) -> Result<Handshake, PoolError> {
        self.expect(SessionState::Connected)?;
        self.state = SessionState::Handshaking;
        let server_version = self.recv(VERSION_LIMIT)?;
        let outdated = self.guard(is_outdated(&server_version, local_version))?;
        let motd = if with_motd {
            self.send("MOTD")?;
            Some(self.recv(MOTD_LIMIT)?)
        } else {
            None
        };
        self.state = SessionState::Ready;
        Ok(Handshake {
            server_version: server_version.trim().to_string(),
            outdated,
            motd,
        })
    }

    pub fn request_job(&mut self, username: &str, kind: &str, key: &str) -> Result<JobReply, PoolError> {
        self.expect(SessionState::Ready)?;
        self.send(&format_job_request(username, kind, key))?;
        self.state = SessionState::JobRequested;
        let raw = self.recv(JOB_LIMIT)?;
        let reply = self.guard(parse_job_reply(&raw))?;
        self.state = match reply {
            JobReply::Job(_) => SessionState::JobReceived,
            JobReply::Notice(_) => SessionState::Ready,
        };
        Ok(reply)
    }

    /// Sends a share and waits for the verdict; `ping` spans send to reply.
    pub fn submit_result(
        &mut self,
        result: &DeviceResult,
        hashrate: f64,
        client_tag: &str,
        device_tag: &str,
    ) -> Result<Submitted, PoolError> {
        self.expect(SessionState::JobReceived)?;
        let line = format_result(result.nonce, hashrate, client_tag, device_tag, &result.device_id);
        let start = Instant::now();
        self.send(&line)?;
        self.state = SessionState::ResultSubmitted;
        let raw = self.recv(FEEDBACK_LIMIT)?;
        let ping = start.elapsed();
        self.state = SessionState::Ready;
        Ok(Submitted {
            feedback: Feedback::parse(&raw),
            ping,
        })
    }

    /// Returns to `Ready` after a job was received but never answered.
    pub fn abandon_job(&mut self) {
        if self.state == SessionState::JobReceived {
            self.state = SessionState::Ready;
        }
    }

    fn expect(&self, want: SessionState) -> Result<(), PoolError> {
        if self.state == want {
            Ok(())
        } else {
            Err(PoolError::Protocol(format!(
                "session is {:?}, expected {:?}",
                self.state, want
            )))
        }
    }

    fn guard<T>(&mut self, res: Result<T, PoolError>) -> Result<T, PoolError> {
        if res.is_err() {
            self.disconnect();
        }
        res
    }

    fn send(&mut self, msg: &str) -> Result<(), PoolError> {
        let res = match self.stream.as_mut() {
            Some(stream) => stream.write_all(msg.as_bytes()).map_err(PoolError::from),
            None => Err(PoolError::Protocol("not connected".into())),
        };
        self.guard(res)
    }

    /// One read of at most `limit` bytes, trailing newline removed.
    fn recv(&mut self, limit: usize) -> Result<String, PoolError> {
        let res = match self.stream.as_mut() {
            Some(stream) => {
                let mut buf = vec![0u8; limit];
                match stream.read(&mut buf) {
                    Ok(0) => Err(PoolError::Connection(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pool closed the connection",
                    ))),
                    Ok(n) => Ok(String::from_utf8_lossy(&buf[..n])
                        .trim_end_matches('\n')
                        .to_string()),
                    Err(e) => Err(PoolError::from(e)),
                }
            }
            None => Err(PoolError::Protocol("not connected".into())),
        };
        self.guard(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::pool::Job;
    use std::net::TcpListener;
    use std::thread;

    fn read_msg(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    /// Plays a pool that hands out one job and answers with `verdict`.
    fn fake_pool(verdict: &'static str) -> (Endpoint, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            s.write_all(b"4.1\n").unwrap();
            seen.push(read_msg(&mut s));
            s.write_all(b"Welcome miners").unwrap();
            seen.push(read_msg(&mut s));
            s.write_all(b"abcd1234,5000000,16\n").unwrap();
            seen.push(read_msg(&mut s));
            s.write_all(verdict.as_bytes()).unwrap();
            seen
        });
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
            name: "local".into(),
        };
        (endpoint, handle)
    }

    fn result() -> DeviceResult {
        DeviceResult {
            nonce: 1234,
            compute_time_micros: 59_000,
            device_id: "ABCD1234".into(),
            checksum: None,
        }
    }

    #[test]
    fn full_session_walks_the_state_machine() {
        let (endpoint, pool) = fake_pool("BAD,LowDifficulty\n");
        let mut conn = PoolConnection::new(Duration::from_secs(5));
        assert_eq!(conn.state(), SessionState::Disconnected);

        conn.connect(&endpoint).unwrap();
        assert_eq!(conn.state(), SessionState::Connected);

        let hs = conn.handshake("4.1", true).unwrap();
        assert_eq!(hs.server_version, "4.1");
        assert!(!hs.outdated);
        assert_eq!(hs.motd.as_deref(), Some("Welcome miners"));
        assert!(conn.is_ready());

        let reply = conn.request_job("alice", "AVR", "None").unwrap();
        assert_eq!(
            reply,
            JobReply::Job(Job {
                puzzle: "abcd1234".into(),
                target: "5000000".into(),
                difficulty: 16,
            })
        );
        assert_eq!(conn.state(), SessionState::JobReceived);

        let submitted = conn
            .submit_result(&result(), 20915.25, "USBI2C AVR Miner 4.1", "None8")
            .unwrap();
        assert_eq!(
            submitted.feedback,
            Feedback::Bad(Some("LowDifficulty".into()))
        );
        assert!(conn.is_ready());

        let seen = pool.join().unwrap();
        assert_eq!(seen[0], "MOTD");
        assert_eq!(seen[1], "JOB,alice,AVR,None");
        assert_eq!(seen[2], "1234,20915.25,USBI2C AVR Miner 4.1,None8,ABCD1234");
    }

    #[test]
    fn submit_before_job_is_a_protocol_error() {
        let mut conn = PoolConnection::new(Duration::from_secs(1));
        assert!(matches!(
            conn.submit_result(&result(), 1.0, "t", "d"),
            Err(PoolError::Protocol(_))
        ));
    }

    #[test]
    fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut conn = PoolConnection::new(Duration::from_secs(1));
        let endpoint = Endpoint {
            host: "127.0.0.1".into(),
            port,
            name: "gone".into(),
        };
        assert!(matches!(
            conn.connect(&endpoint),
            Err(PoolError::Connection(_))
        ));
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[test]
    fn closed_socket_disconnects_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            drop(s);
        });
        let mut conn = PoolConnection::new(Duration::from_secs(2));
        conn.connect(&Endpoint {
            host: "127.0.0.1".into(),
            port,
            name: "x".into(),
        })
        .unwrap();
        pool.join().unwrap();
        assert!(conn.handshake("4.1", false).is_err());
        assert_eq!(conn.state(), SessionState::Disconnected);
    }

    #[test]
    fn directory_reply_parsing() {
        let ok: DirectoryReply = serde_json::from_str(
            r#"{"success":true,"ip":"1.2.3.4","port":2811,"name":"node-a"}"#,
        )
        .unwrap();
        assert_eq!(
            ok.into_endpoint().unwrap(),
            Endpoint {
                host: "1.2.3.4".into(),
                port: 2811,
                name: "node-a".into()
            }
        );

        let busy: DirectoryReply =
            serde_json::from_str(r#"{"success":false,"message":"busy"}"#).unwrap();
        assert!(format!("{}", busy.into_endpoint().unwrap_err()).contains("busy"));

        let partial: DirectoryReply = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(partial.into_endpoint().is_err());
    }

    #[test]
    fn endpoint_from_cli() {
        let e = Endpoint::parse("pool.example:2811").unwrap();
        assert_eq!((e.host.as_str(), e.port), ("pool.example", 2811));
        assert_eq!(e.to_string(), "pool.example:2811");
        assert!(Endpoint::parse("nope").is_err());
        assert!(Endpoint::parse("host:port").is_err());
    }
}
