// src/proto/pool.rs
use crate::error::PoolError;

/// Field separator of the pool's text protocol.
pub const SEPARATOR: char = ',';

/// Work issued by the pool for one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub puzzle: String,
    pub target: String,
    pub difficulty: u64,
}

/// What came back for a `JOB` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReply {
    Job(Job),
    /// The pool sent a status message instead of work.
    Notice(String),
}

/// Pool verdict on a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Good,
    Block,
    Bad(Option<String>),
    Unknown(Vec<String>),
}

impl Feedback {
    pub fn parse(raw: &str) -> Self {
        let tokens: Vec<&str> = raw.trim_end_matches(['\r', '\n']).split(SEPARATOR).collect();
        match tokens[0] {
            "GOOD" => Feedback::Good,
            "BLOCK" => Feedback::Block,
            "BAD" => Feedback::Bad(
                tokens
                    .get(1)
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty()),
            ),
            _ => Feedback::Unknown(tokens.iter().map(|t| t.to_string()).collect()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Feedback::Good | Feedback::Block)
    }

    /// Human-readable cause for a rejection, if any.
    pub fn reason(&self) -> Option<String> {
        match self {
            Feedback::Bad(reason) => reason.clone(),
            Feedback::Unknown(tokens) => Some(tokens.join(" ")),
            _ => None,
        }
    }
}

pub fn format_job_request(username: &str, kind: &str, key: &str) -> String {
    format!("JOB{SEPARATOR}{username}{SEPARATOR}{kind}{SEPARATOR}{key}")
}

pub fn format_result(
    nonce: u64,
    hashrate: f64,
    client_tag: &str,
    device_tag: &str,
    device_id: &str,
) -> String {
    format!(
        "{nonce}{SEPARATOR}{hashrate}{SEPARATOR}{client_tag}{SEPARATOR}{device_tag}{SEPARATOR}{device_id}"
    )
}

/// Splits a job reply; a non-numeric difficulty means the pool sent a notice.
pub fn parse_job_reply(raw: &str) -> Result<JobReply, PoolError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.is_empty() {
        return Err(PoolError::Protocol("empty job reply".into()));
    }
    let fields: Vec<&str> = raw.split(SEPARATOR).collect();
    if let [puzzle, target, difficulty, ..] = fields.as_slice()
        && let Ok(difficulty) = difficulty.trim().parse::<u64>()
    {
        return Ok(JobReply::Job(Job {
            puzzle: puzzle.to_string(),
            target: target.to_string(),
            difficulty,
        }));
    }
    let notice = fields.get(1).copied().unwrap_or(raw);
    Ok(JobReply::Notice(notice.to_string()))
}

/// True when the pool announces a newer protocol version than `local`.
pub fn is_outdated(server_version: &str, local: &str) -> Result<bool, PoolError> {
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|_| PoolError::Protocol(format!("bad version token {v:?}")))
    };
    Ok(parse(server_version)? > parse(local)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feedback_variants() {
        assert_eq!(Feedback::parse("GOOD\n"), Feedback::Good);
        assert_eq!(Feedback::parse("BLOCK"), Feedback::Block);
        assert_eq!(
            Feedback::parse("BAD,LowDifficulty"),
            Feedback::Bad(Some("LowDifficulty".into()))
        );
        assert_eq!(Feedback::parse("BAD"), Feedback::Bad(None));
        assert_eq!(
            Feedback::parse("WHAT,is,this"),
            Feedback::Unknown(vec!["WHAT".into(), "is".into(), "this".into()])
        );
        assert_eq!(Feedback::parse(""), Feedback::Unknown(vec!["".into()]));
    }

    #[test]
    fn feedback_reasons() {
        assert!(Feedback::Block.is_accepted());
        assert!(!Feedback::Bad(None).is_accepted());
        assert_eq!(
            Feedback::parse("BAD,LowDifficulty").reason().as_deref(),
            Some("LowDifficulty")
        );
        assert_eq!(Feedback::parse("NOPE,x").reason().as_deref(), Some("NOPE x"));
        assert_eq!(Feedback::Good.reason(), None);
    }

    #[test]
    fn parses_job_or_notice() {
        assert_eq!(
            parse_job_reply("abcd1234,5000000,16\n").unwrap(),
            JobReply::Job(Job {
                puzzle: "abcd1234".into(),
                target: "5000000".into(),
                difficulty: 16,
            })
        );
        assert_eq!(
            parse_job_reply("NO,Too many workers,x").unwrap(),
            JobReply::Notice("Too many workers".into())
        );
        assert_eq!(
            parse_job_reply("BAD").unwrap(),
            JobReply::Notice("BAD".into())
        );
        assert!(parse_job_reply("").is_err());
    }

    #[test]
    fn formats_lines() {
        assert_eq!(
            format_job_request("alice", "AVR", "None"),
            "JOB,alice,AVR,None"
        );
        assert_eq!(
            format_result(1234, 20915.25, "USBI2C AVR Miner 4.1", "rig8", "ABCD1234"),
            "1234,20915.25,USBI2C AVR Miner 4.1,rig8,ABCD1234"
        );
    }

    #[test]
    fn version_comparison() {
        assert!(!is_outdated("4.1", "4.1").unwrap());
        assert!(is_outdated("4.2\n", "4.1").unwrap());
        assert!(!is_outdated("3.0", "4.1").unwrap());
        assert!(is_outdated("x", "4.1").is_err());
    }
}
