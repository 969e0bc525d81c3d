use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::{PollOutcome, SerialBus};
use crate::config::{DeviceAddress, Settings};
use crate::error::{BusError, CycleError, DeliveryError, FrameError, PoolError};
use crate::frame::{DeviceResult, build_job_frame, parse_result};
use crate::output::{OutputSink, Severity, ShareKind, ShareLine};
use crate::pool::{Endpoint, Handshake, PoolConnection, fetch_endpoint};
use crate::proto::pool::{Feedback, Job, JobReply};
use crate::retry::{Attempt, Outcome, RetryPolicy};
use crate::stats::{HashrateBoard, ReportScheduler, SessionCounters, WorkerStats};

/// Pool protocol version this client speaks.
pub const LOCAL_VERSION: &str = "4.1";
pub const CLIENT_TAG: &str = "USBI2C AVR Miner 4.1";
const DEVICE_KIND: &str = "AVR";

/// Extra delivery attempts per job before the board is treated as idle.
const BUS_RETRIES: u32 = 10;
/// Failed connects before the endpoint is looked up again.
const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(10);
const NOTICE_PAUSE: Duration = Duration::from_secs(3);
const POOL_ERROR_PAUSE: Duration = Duration::from_secs(5);
const OUTDATED_PAUSE: Duration = Duration::from_secs(10);
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Wait between delivery attempts to one board.
const BUS_BACKOFF: Duration = Duration::from_millis(100);
/// Wait after a board used up its retries, before the next job request.
const BOARD_PAUSE: Duration = Duration::from_secs(5);

/// State shared by every worker.
pub struct MinerState {
    pub settings: Settings,
    pub bus: SerialBus,
    pub counters: SessionCounters,
    pub hashrates: HashrateBoard,
    pub sink: Arc<dyn OutputSink>,
    pub started: Instant,
    motd: Mutex<String>,
}

impl MinerState {
    pub fn new(settings: Settings, bus: SerialBus, sink: Arc<dyn OutputSink>) -> Self {
        let workers = settings.addresses.len();
        Self {
            settings,
            bus,
            counters: SessionCounters::default(),
            hashrates: HashrateBoard::new(workers),
            sink,
            started: Instant::now(),
            motd: Mutex::new(String::new()),
        }
    }

    fn set_motd(&self, motd: &str) {
        *self.motd.lock().unwrap_or_else(|p| p.into_inner()) = motd.to_string();
    }

    fn motd(&self) -> String {
        self.motd.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Drives one board: job in from the pool, over the bus, result back out.
pub struct DeviceWorker {
    id: usize,
    addr: DeviceAddress,
    shared: Arc<MinerState>,
    endpoint: Endpoint,
    stats: WorkerStats,
    reporter: Option<ReportScheduler>,
    idle_poll: Duration,
    bus_backoff: Duration,
    board_pause: Duration,
}

impl DeviceWorker {
    /// Worker 0 also owns the periodic report.
    pub fn new(id: usize, addr: DeviceAddress, shared: Arc<MinerState>, endpoint: Endpoint) -> Self {
        let reporter =
            (id == 0).then(|| ReportScheduler::new(shared.settings.report_interval, Instant::now()));
        Self {
            id,
            addr,
            shared,
            endpoint,
            stats: WorkerStats::default(),
            reporter,
            idle_poll: IDLE_POLL,
            bus_backoff: BUS_BACKOFF,
            board_pause: BOARD_PAUSE,
        }
    }

    #[cfg(test)]
    fn with_timing(mut self, idle_poll: Duration, bus_backoff: Duration, board_pause: Duration) -> Self {
        self.idle_poll = idle_poll;
        self.bus_backoff = bus_backoff;
        self.board_pause = board_pause;
        self
    }

    fn sender(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.addr)
    }

    fn say(&self, prefix: &str, msg: &str, severity: Severity) {
        self.shared.sink.pretty_print(&self.sender(prefix), msg, severity);
    }

    /// Mines until the process exits.
    pub fn run(mut self) {
        loop {
            let mut conn = self.connect();
            self.say(
                "sys",
                &format!("Mining thread started on board {}", self.addr),
                Severity::Success,
            );
            self.flush_quietly();

            let err = self.mine(&mut conn);
            debug!(addr = %self.addr, session = ?conn.state(), "left mining loop: {err}");
            conn.disconnect();
            self.say(
                "net",
                &format!("Error communicating with the server ({err})"),
                Severity::Error,
            );
            thread::sleep(POOL_ERROR_PAUSE);
        }
    }

    /// Connects and handshakes, re-resolving the endpoint after repeated failures.
    fn connect(&mut self) -> PoolConnection {
        let policy = RetryPolicy::bounded(CONNECT_RETRIES, CONNECT_BACKOFF);
        let timeout = self.shared.settings.soc_timeout;
        loop {
            let outcome = policy.run(
                |_| {
                    debug!(endpoint = %self.endpoint, "connecting");
                    let mut conn = PoolConnection::new(timeout);
                    let res = conn
                        .connect(&self.endpoint)
                        .and_then(|_| conn.handshake(LOCAL_VERSION, self.id == 0));
                    match res {
                        Ok(hs) => Attempt::Done((conn, hs)),
                        Err(e) => Attempt::Retry(e),
                    }
                },
                |e, _| self.report_connect_error(e),
            );
            match outcome {
                Outcome::Success((conn, hs)) => {
                    self.announce(&hs);
                    return conn;
                }
                Outcome::GaveUp { last, attempts } => {
                    self.report_connect_error(&last);
                    warn!(addr = %self.addr, attempts, "pool unreachable, looking up a new node");
                    thread::sleep(CONNECT_BACKOFF);
                    match &self.shared.settings.pool {
                        Some(fixed) => info!(pool = %fixed, "pool is fixed, retrying the same node"),
                        None => {
                            self.endpoint = fetch_endpoint(
                                &self.shared.settings.pool_directory,
                                self.shared.sink.as_ref(),
                            )
                        }
                    }
                }
            }
        }
    }

    fn report_connect_error(&self, e: &PoolError) {
        self.shared.sink.pretty_print(
            "net0",
            &format!("Error connecting to the server (connection err: {e})"),
            Severity::Error,
        );
    }

    fn announce(&self, hs: &Handshake) {
        if self.id != 0 {
            return;
        }
        if hs.outdated {
            self.shared.sink.pretty_print(
                "sys0",
                &format!(
                    "Miner is outdated (v{LOCAL_VERSION}) - server is on version {}, please update",
                    hs.server_version
                ),
                Severity::Warning,
            );
            thread::sleep(OUTDATED_PAUSE);
        } else {
            self.shared.sink.pretty_print(
                "net0",
                &format!("Connected to the server (v{})", hs.server_version),
                Severity::Success,
            );
        }
        if let Some(motd) = &hs.motd {
            self.shared.set_motd(motd);
            self.shared.sink.pretty_print(
                "net0",
                &format!("MOTD: {}", motd.replace('\n', "\n\t\t")),
                Severity::Success,
            );
        }
    }

    /// Runs cycles until the pool session fails; returns why.
    ///
    /// A board that never answers only costs the current job.
    fn mine(&mut self, conn: &mut PoolConnection) -> PoolError {
        loop {
            if !conn.is_ready() {
                return PoolError::Protocol(format!("session left in {:?}", conn.state()));
            }
            match self.cycle(conn) {
                Ok(_) => {}
                Err(CycleError::Pool(e)) => return e,
                Err(err @ CycleError::Board { .. }) => {
                    self.say(
                        "sys",
                        &format!(
                            "Board connection error ({err}), check the wiring, the port setting or reset the board"
                        ),
                        Severity::Warning,
                    );
                    thread::sleep(self.board_pause);
                }
            }
        }
    }

    /// One request, deliver, collect, submit, interpret round.
    pub(crate) fn cycle(&mut self, conn: &mut PoolConnection) -> Result<Feedback, CycleError> {
        let job = self.next_job(conn)?;
        let result = match self.deliver(&job) {
            Ok(result) => result,
            Err(e) => {
                conn.abandon_job();
                return Err(e);
            }
        };

        let hashrate = result.hashrate();
        let mean = self.stats.record_hashrate(hashrate);
        self.shared.hashrates.set(self.id, mean);

        let device_tag = format!("{}{}", self.shared.settings.rig, self.addr);
        let submitted = conn.submit_result(&result, hashrate, CLIENT_TAG, &device_tag)?;
        self.stats.record_ping(submitted.ping);
        debug!(addr = %self.addr, feedback = ?submitted.feedback, "pool feedback");

        self.settle(&job, &result, hashrate, &submitted.feedback);
        Ok(submitted.feedback)
    }

    fn next_job(&self, conn: &mut PoolConnection) -> Result<Job, PoolError> {
        let settings = &self.shared.settings;
        loop {
            debug!(addr = %self.addr, "requesting job");
            match conn.request_job(&settings.username, DEVICE_KIND, &settings.key)? {
                JobReply::Job(job) => return Ok(job),
                JobReply::Notice(msg) => {
                    self.say("sys", &format!("Node message: {msg}"), Severity::Warning);
                    thread::sleep(NOTICE_PAUSE);
                }
            }
        }
    }

    /// Pushes `job` to the board and waits for a valid answer, with bounded retries.
    pub(crate) fn deliver(&self, job: &Job) -> Result<DeviceResult, CycleError> {
        let policy = RetryPolicy::bounded(BUS_RETRIES, self.bus_backoff);
        let outcome = policy.run(
            |_| match self.deliver_once(job) {
                Ok(result) => Attempt::Done(result),
                Err(e) => Attempt::Retry(e),
            },
            |e, n| {
                self.shared.counters.inc_bus_retry();
                debug!(addr = %self.addr, attempt = n, "retrying job delivery: {e}");
            },
        );
        match outcome {
            Outcome::Success(result) => Ok(result),
            Outcome::GaveUp { last, attempts } => {
                self.shared.counters.inc_bus_retry();
                self.flush_quietly();
                Err(CycleError::Board {
                    addr: self.addr,
                    attempts,
                    last,
                })
            }
        }
    }

    pub(crate) fn deliver_once(&self, job: &Job) -> Result<DeviceResult, DeliveryError> {
        self.send_job(job)?;
        self.receive_result()
    }

    /// Clears this board's accumulator, then writes the job frame token by token.
    ///
    /// Other workers may route this board's first answer tokens while the
    /// frame is still being paced out, so the reset must come first.
    fn send_job(&self, job: &Job) -> Result<(), BusError> {
        let shared = &self.shared;
        let frame = build_job_frame(job, shared.settings.checksum);
        debug!(addr = %self.addr, frame = ?frame, "sending job to the board");

        shared.bus.reset(self.addr);
        for ch in frame.chars() {
            shared.bus.write_byte(self.addr, ch)?;
            if let Some(gap) = shared.settings.pacing.sleep_for() {
                thread::sleep(gap);
            }
        }
        Ok(())
    }

    fn receive_result(&self) -> Result<DeviceResult, DeliveryError> {
        let shared = &self.shared;
        let checksum = shared.settings.checksum;
        let raw = self.collect()?;
        debug!(addr = %self.addr, response = %raw, "board response");

        match parse_result(&raw, checksum) {
            Ok(result) => {
                debug!(addr = %self.addr, nonce = result.nonce, crc = ?result.checksum, "result accepted");
                Ok(result)
            }
            Err(e) => {
                if let FrameError::ChecksumMismatch { expected, received } = &e {
                    shared.counters.inc_checksum_failure();
                    debug!(addr = %self.addr, expected, received = %received, "crc8 mismatch");
                }
                self.flush_quietly();
                Err(e.into())
            }
        }
    }

    /// Polls until this board's frame is complete, corrupted, or the job budget is spent.
    fn collect(&self) -> Result<String, BusError> {
        let bus = &self.shared.bus;
        let start = Instant::now();
        let mut quiet = true;
        loop {
            let outcome = match bus.poll_routed(self.addr) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.flush_quietly();
                    return Err(e);
                }
            };
            match outcome {
                PollOutcome::Complete(frame) => return Ok(frame),
                PollOutcome::Corrupted(partial) => {
                    self.flush_quietly();
                    return Err(BusError::Corrupted {
                        addr: self.addr,
                        reason: format!("error token after {partial:?}"),
                    });
                }
                PollOutcome::Waiting { fresh: true } => quiet = false,
                PollOutcome::Waiting { fresh: false } => {
                    if quiet && !self.idle_poll.is_zero() {
                        thread::sleep(self.idle_poll);
                    }
                }
            }
            if start.elapsed() > self.shared.settings.job_timeout {
                bus.mark_timed_out(self.addr);
                debug!(addr = %self.addr, state = ?bus.state(self.addr), "job budget spent");
                self.flush_quietly();
                return Err(BusError::Timeout(self.addr));
            }
        }
    }

    fn flush_quietly(&self) {
        if let Err(e) = self.shared.bus.flush(self.addr) {
            warn!(addr = %self.addr, "bus flush failed: {e}");
        }
    }

    /// Books the pool's verdict, prints the share line and, on worker 0, the periodic report.
    pub(crate) fn settle(&mut self, job: &Job, result: &DeviceResult, hashrate: f64, feedback: &Feedback) {
        let shared = &self.shared;
        shared.counters.apply(feedback);
        let snap = shared.counters.snapshot();

        let (kind, shown_rate) = match feedback {
            Feedback::Block => (ShareKind::Block, self.stats.hashrate()),
            _ if feedback.is_accepted() => (ShareKind::Accepted, self.stats.hashrate()),
            _ => (ShareKind::Rejected(feedback.reason()), hashrate),
        };
        if let Feedback::Unknown(tokens) = feedback {
            debug!(addr = %self.addr, ?job, ?result, ?tokens, "unexpected pool feedback");
            self.flush_quietly();
        }

        shared.sink.share_print(&ShareLine {
            addr: self.addr,
            kind,
            accepted: snap.accepted,
            rejected: snap.rejected,
            hashrate: shown_rate,
            compute_time: result.compute_time_secs(),
            difficulty: job.difficulty,
            ping_ms: self.stats.ping_ms(),
        });

        if let Some(reporter) = self.reporter.as_mut() {
            let now = Instant::now();
            if let Some(report) = reporter.maybe_report(
                now,
                snap,
                shared.hashrates.total(),
                now.duration_since(shared.started),
            ) {
                shared.sink.pretty_print(
                    "net0",
                    &format!("POOL_INFO: {}", shared.motd()),
                    Severity::Success,
                );
                shared.sink.pretty_print("sys0", &report.render(), Severity::Success);
            }
        }
    }
}
