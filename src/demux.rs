//! Reassembly of trickling, address-tagged gateway tokens into result frames.
//!
//! The gateway answers each read with at most one token, tagged with the device
//! it came from, which is not necessarily the device that was polled. Tokens
//! are therefore routed by their tag into a per-address [`Accumulator`].

use crate::config::{DeviceAddress, MAX_ADDRESS};
use crate::proto::gateway::GatewayReply;
use crate::proto::pool::SEPARATOR;

const ERROR_MARK: char = '#';
const TERMINATOR: char = '\n';

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccumState {
    #[default]
    Empty,
    Accumulating(String),
    Complete(String),
    Corrupted(String),
    TimedOut(String),
}

/// Effect of feeding one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing usable arrived.
    Idle,
    Appended,
    Complete,
    Corrupted,
    /// Already complete, corrupted or timed out; waits for a reset.
    Settled,
}

#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    state: AccumState,
}

impl Accumulator {
    pub fn state(&self) -> &AccumState {
        &self.state
    }

    pub fn buffer(&self) -> &str {
        match &self.state {
            AccumState::Empty => "",
            AccumState::Accumulating(b)
            | AccumState::Complete(b)
            | AccumState::Corrupted(b)
            | AccumState::TimedOut(b) => b,
        }
    }

    pub fn feed(&mut self, token: &str, expected_fields: usize) -> Progress {
        let mut buf = match std::mem::take(&mut self.state) {
            AccumState::Empty => String::new(),
            AccumState::Accumulating(b) => b,
            settled => {
                self.state = settled;
                return Progress::Settled;
            }
        };

        if token.contains(ERROR_MARK) {
            self.state = AccumState::Corrupted(buf);
            return Progress::Corrupted;
        }

        let trimmed = token.trim();
        let appended = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == SEPARATOR);
        if appended {
            buf.push_str(trimmed);
        }

        if token.contains(TERMINATOR) && buf.split(SEPARATOR).count() == expected_fields {
            self.state = AccumState::Complete(buf);
            return Progress::Complete;
        }

        let progress = if appended {
            Progress::Appended
        } else {
            Progress::Idle
        };
        self.state = if buf.is_empty() {
            AccumState::Empty
        } else {
            AccumState::Accumulating(buf)
        };
        progress
    }

    pub fn time_out(&mut self) {
        let buf = self.buffer().to_string();
        self.state = AccumState::TimedOut(buf);
    }

    /// Hands out a complete frame and starts over.
    pub fn take_complete(&mut self) -> Option<String> {
        match std::mem::take(&mut self.state) {
            AccumState::Complete(frame) => Some(frame),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = AccumState::Empty;
    }
}

/// Fixed-capacity table of accumulators, one slot per bus address.
#[derive(Debug)]
pub struct Demux {
    expected_fields: usize,
    slots: Vec<Option<Accumulator>>,
}

impl Demux {
    pub fn new(addresses: &[DeviceAddress], expected_fields: usize) -> Self {
        let mut slots = vec![None; MAX_ADDRESS as usize + 1];
        for addr in addresses {
            slots[addr.get() as usize] = Some(Accumulator::default());
        }
        Self {
            expected_fields,
            slots,
        }
    }

    /// Feeds a reply into the slot its tag names. `None` if that address is not registered.
    pub fn route(&mut self, reply: &GatewayReply) -> Option<Progress> {
        let expected = self.expected_fields;
        self.get_mut(reply.addr)
            .map(|acc| acc.feed(&reply.token, expected))
    }

    pub fn get(&self, addr: DeviceAddress) -> Option<&Accumulator> {
        self.slots[addr.get() as usize].as_ref()
    }

    pub fn get_mut(&mut self, addr: DeviceAddress) -> Option<&mut Accumulator> {
        self.slots[addr.get() as usize].as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> DeviceAddress {
        DeviceAddress::new(raw).unwrap()
    }

    fn reply(a: u8, token: &str) -> GatewayReply {
        GatewayReply {
            addr: addr(a),
            token: token.to_string(),
        }
    }

    fn tokens(frame: &str) -> Vec<String> {
        frame.chars().map(|c| c.to_string()).collect()
    }

    #[test]
    fn completes_on_terminator_with_field_count() {
        let mut acc = Accumulator::default();
        for t in tokens("1234,59000,ABCD1234") {
            assert_eq!(acc.feed(&t, 3), Progress::Appended);
        }
        assert_eq!(acc.feed("\n", 3), Progress::Complete);
        assert_eq!(acc.take_complete().as_deref(), Some("1234,59000,ABCD1234"));
        assert_eq!(acc.state(), &AccumState::Empty);
    }

    #[test]
    fn terminator_without_all_fields_keeps_waiting() {
        let mut acc = Accumulator::default();
        for t in tokens("12,34") {
            acc.feed(&t, 3);
        }
        assert_eq!(acc.feed("\n", 3), Progress::Idle);
        assert_eq!(acc.state(), &AccumState::Accumulating("12,34".into()));
    }

    #[test]
    fn error_mark_corrupts_and_settles() {
        let mut acc = Accumulator::default();
        acc.feed("1", 3);
        assert_eq!(acc.feed("#", 3), Progress::Corrupted);
        assert_eq!(acc.feed("2", 3), Progress::Settled);
        assert_eq!(acc.state(), &AccumState::Corrupted("1".into()));
        acc.reset();
        assert_eq!(acc.state(), &AccumState::Empty);
    }

    #[test]
    fn junk_tokens_are_ignored() {
        let mut acc = Accumulator::default();
        assert_eq!(acc.feed("", 3), Progress::Idle);
        assert_eq!(acc.feed(" ", 3), Progress::Idle);
        assert_eq!(acc.feed("!", 3), Progress::Idle);
        assert_eq!(acc.state(), &AccumState::Empty);
    }

    #[test]
    fn timeout_keeps_partial_buffer() {
        let mut acc = Accumulator::default();
        acc.feed("9", 3);
        acc.time_out();
        assert_eq!(acc.state(), &AccumState::TimedOut("9".into()));
        assert_eq!(acc.take_complete(), None);
    }

    #[test]
    fn unregistered_address_is_not_routed() {
        let mut demux = Demux::new(&[addr(8)], 3);
        assert_eq!(demux.route(&reply(9, "1")), None);
        assert_eq!(demux.route(&reply(8, "1")), Some(Progress::Appended));
    }

    #[test]
    fn interleavings_never_cross_contaminate() {
        let a_frame = "1,2,A\n";
        let b_frame = "3,4,B\n";
        let a = tokens(a_frame);
        let b = tokens(b_frame);
        let n = a.len() + b.len();

        // every placement of a's tokens among n slots, order within each stream kept
        for mask in 0u32..(1 << n) {
            if mask.count_ones() as usize != a.len() {
                continue;
            }
            let mut demux = Demux::new(&[addr(8), addr(0x1a)], 3);
            let (mut ia, mut ib) = (0, 0);
            for slot in 0..n {
                if mask & (1 << slot) != 0 {
                    demux.route(&reply(8, &a[ia]));
                    ia += 1;
                } else {
                    demux.route(&reply(0x1a, &b[ib]));
                    ib += 1;
                }
            }
            assert_eq!(
                demux.get_mut(addr(8)).unwrap().take_complete().as_deref(),
                Some("1,2,A")
            );
            assert_eq!(
                demux.get_mut(addr(0x1a)).unwrap().take_complete().as_deref(),
                Some("3,4,B")
            );
        }
    }
}
