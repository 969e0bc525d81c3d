use std::sync::Mutex;

use chrono::Local;
use colored::{ColoredString, Colorize};

use crate::config::DeviceAddress;
use crate::frame::round_to;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShareKind {
    Accepted,
    Block,
    Rejected(Option<String>),
}

/// Everything shown on one share line.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareLine {
    pub addr: DeviceAddress,
    pub kind: ShareKind,
    pub accepted: u64,
    pub rejected: u64,
    pub hashrate: f64,
    pub compute_time: f64,
    pub difficulty: u64,
    pub ping_ms: f64,
}

/// Where user-facing text goes. Implementations serialise their own output.
pub trait OutputSink: Send + Sync {
    fn pretty_print(&self, sender: &str, msg: &str, severity: Severity);
    fn share_print(&self, share: &ShareLine);
}

/// Colored terminal output, one whole line per lock.
#[derive(Default)]
pub struct ConsoleSink {
    lock: Mutex<()>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&self, line: String) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        println!("{} {}", Local::now().format("%H:%M:%S").to_string().dimmed(), line);
    }
}

fn sender_badge(sender: &str) -> ColoredString {
    let text = format!(" {sender} ").bold();
    if sender.starts_with("net") {
        text.on_blue()
    } else if sender.starts_with("avr") {
        text.on_magenta()
    } else {
        text.on_green()
    }
}

impl OutputSink for ConsoleSink {
    fn pretty_print(&self, sender: &str, msg: &str, severity: Severity) {
        let msg = msg.trim();
        let msg = match severity {
            Severity::Success => msg.green(),
            Severity::Info => msg.blue(),
            Severity::Error => msg.red(),
            Severity::Warning => msg.yellow(),
        };
        self.line(format!("{} {}", sender_badge(sender), msg));
    }

    fn share_print(&self, share: &ShareLine) {
        let label = match &share.kind {
            ShareKind::Accepted => "⛏ Accepted ".green(),
            ShareKind::Block => "⛏ Block found ".yellow(),
            ShareKind::Rejected(Some(reason)) => format!("⛏ Rejected ({reason}) ").red(),
            ShareKind::Rejected(None) => "⛏ Rejected ".red(),
        };
        let total = share.accepted + share.rejected;
        let pct = if total == 0 {
            0
        } else {
            (share.accepted as f64 / total as f64 * 100.0).round() as u64
        };
        self.line(format!(
            "{} {}{}/{} {} ∙ {:04.1}s ∙ {} ⚙ diff {} ∙ ping {}ms",
            sender_badge(&format!("avr{}", share.addr)),
            label,
            share.accepted,
            total,
            format!("({pct}%)").magenta(),
            share.compute_time,
            format_prefix(share.hashrate, "H/s", 2).blue().bold(),
            format_prefix(share.difficulty as f64, "", 0),
            share.ping_ms.round() as u64,
        ));
    }
}

/// Scales `val` to k/M/G/T: `20915.0, "H/s"` becomes `21 kH/s`.
pub fn format_prefix(val: f64, symbol: &str, accuracy: i32) -> String {
    let scaled = if val >= 1e12 {
        format!("{} T", round_to(val / 1e12, accuracy))
    } else if val >= 1e9 {
        format!("{} G", round_to(val / 1e9, accuracy))
    } else if val >= 1e6 {
        format!("{} M", round_to(val / 1e6, accuracy))
    } else if val >= 1e3 {
        format!("{} k", (val / 1e3).round())
    } else if symbol.is_empty() {
        format!("{}", val.round())
    } else {
        format!("{} ", val.round())
    };
    scaled + symbol
}
