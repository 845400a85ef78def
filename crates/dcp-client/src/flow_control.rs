//! Flow-control accounting for one channel.
//!
//! The server promises never to have more than `connection_buffer_size`
//! bytes in flight without acknowledgement. The client charges every
//! data-bearing frame at its full framed size when it arrives and
//! credits it back once consumed; crossing the ack threshold emits a
//! DCP_BUFFER_ACK. The counters are owned by the channel task — credit
//! from other threads (MANUAL mode) arrives as a channel command.

use std::time::{Duration, Instant};

/// When flow-control credit is returned for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// Credit returned before the listener callback runs.
    Auto,
    /// Credit returned after the listener callback returns.
    AutoAfterCallback,
    /// The application calls the acknowledge hook itself.
    Manual,
}

/// Byte accounting against the negotiated buffer.
#[derive(Debug)]
pub struct FlowControl {
    buffer_bytes: u64,
    ack_watermark: u64,
    /// Bytes of data frames received from the server.
    received_total: u64,
    /// Bytes consumed (listener done with them); eligible for ack.
    credited_total: u64,
    /// Bytes already acknowledged on the wire.
    acked_total: u64,
    last_credit_at: Instant,
    stall_reported: bool,
}

impl FlowControl {
    pub fn new(buffer_bytes: u32, ack_threshold: f64) -> Self {
        let buffer = u64::from(buffer_bytes);
        Self {
            buffer_bytes: buffer,
            ack_watermark: ((buffer as f64) * ack_threshold) as u64,
            received_total: 0,
            credited_total: 0,
            acked_total: 0,
            last_credit_at: Instant::now(),
            stall_reported: false,
        }
    }

    /// Charge an arriving data frame.
    pub fn on_frame(&mut self, frame_bytes: usize) {
        self.received_total += frame_bytes as u64;
    }

    /// Return credit for consumed bytes. When consumption crosses the
    /// ack watermark, returns the cumulative consumed-byte value to put
    /// in a DCP_BUFFER_ACK (truncated to the wire's 32 bits).
    pub fn credit(&mut self, bytes: u64) -> Option<u32> {
        self.credited_total += bytes;
        self.last_credit_at = Instant::now();
        self.stall_reported = false;

        if self.credited_total - self.acked_total >= self.ack_watermark {
            self.acked_total = self.credited_total;
            Some(self.credited_total as u32)
        } else {
            None
        }
    }

    /// Bytes the server considers in flight.
    pub fn unacked(&self) -> u64 {
        self.received_total - self.acked_total
    }

    /// Stall: the server-side window is exhausted and no credit has
    /// come back for longer than the keepalive interval. Reported once
    /// per stall episode.
    pub fn check_stall(&mut self, keepalive: Duration) -> Option<(u64, u64)> {
        if self.stall_reported {
            return None;
        }
        if self.unacked() >= self.buffer_bytes && self.last_credit_at.elapsed() > keepalive {
            self.stall_reported = true;
            return Some((self.unacked(), self.buffer_bytes));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_emitted_at_threshold() {
        let mut fc = FlowControl::new(1000, 0.5);
        fc.on_frame(200);
        assert_eq!(fc.credit(200), None);
        fc.on_frame(200);
        assert_eq!(fc.credit(200), None);
        fc.on_frame(100);
        // 500 consumed bytes outstanding: watermark reached.
        assert_eq!(fc.credit(100), Some(500));
        assert_eq!(fc.unacked(), 0);
    }

    #[test]
    fn test_ack_value_is_cumulative() {
        let mut fc = FlowControl::new(100, 0.5);
        fc.on_frame(60);
        assert_eq!(fc.credit(60), Some(60));
        fc.on_frame(60);
        assert_eq!(fc.credit(60), Some(120));
    }

    #[test]
    fn test_manual_mode_defers_credit() {
        let mut fc = FlowControl::new(1000, 0.5);
        for _ in 0..5 {
            fc.on_frame(200);
        }
        // Nothing consumed yet: the full kilobyte is outstanding.
        assert_eq!(fc.unacked(), 1000);
        assert_eq!(fc.credit(1000), Some(1000));
        assert_eq!(fc.unacked(), 0);
    }

    #[test]
    fn test_stall_detected_once() {
        let mut fc = FlowControl::new(100, 0.5);
        fc.on_frame(100);
        // Not stalled until the keepalive interval has passed.
        assert!(fc.check_stall(Duration::from_secs(3600)).is_none());
        assert_eq!(fc.check_stall(Duration::ZERO), Some((100, 100)));
        // Only reported once per episode.
        assert!(fc.check_stall(Duration::ZERO).is_none());
        // Credit clears the episode.
        fc.credit(100);
        assert!(fc.check_stall(Duration::ZERO).is_none());
    }
}
