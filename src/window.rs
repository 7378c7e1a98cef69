/// Sliding replay window for DTLS record sequence numbers.
///
/// Maintains the latest accepted sequence number and a 64-bit bitmap of the
/// last 64 seen sequence numbers to reject duplicates and old records.
///
/// Checking and marking are separate steps: a record is checked before it is
/// decrypted, but only marked once decryption succeeded. Forged records can
/// therefore never advance the window.
///
/// Each epoch has its own `ReplayWindow` instance, owned by the read state of
/// that epoch in the session.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    max_seq: Option<u64>,
    window: u64,
}

/// How records below the window's lower edge are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayFilter {
    /// No replay detection.
    Off,
    /// Records below the window are let through, the window is only used
    /// to detect duplicates inside it.
    Window,
    /// Records below the window are rejected, even when never seen.
    #[default]
    Strict,
}

const WINDOW_SIZE: u64 = 64;

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `seqno` may be processed.
    ///
    /// Does not modify the window.
    pub fn is_acceptable(&self, seqno: u64, filter: ReplayFilter) -> bool {
        let Some(max_seq) = self.max_seq else {
            return true;
        };
        if filter == ReplayFilter::Off || seqno > max_seq {
            return true;
        }
        let offset = max_seq - seqno;
        if offset >= WINDOW_SIZE {
            // too old
            return filter == ReplayFilter::Window;
        }
        (self.window & (1u64 << offset)) == 0
    }

    /// Mark `seqno` as seen.
    ///
    /// Returns true if it is the newest sequence number seen so far.
    pub fn mark_read(&mut self, seqno: u64) -> bool {
        let Some(max_seq) = self.max_seq else {
            self.max_seq = Some(seqno);
            self.window = 1;
            return true;
        };

        if seqno > max_seq {
            let delta = seqno - max_seq;
            if delta >= WINDOW_SIZE {
                self.window = 0;
            } else {
                self.window <<= delta;
            }
            self.window |= 1; // mark newest as seen
            self.max_seq = Some(seqno);
            true
        } else {
            let offset = max_seq - seqno;
            if offset < WINDOW_SIZE {
                self.window |= 1u64 << offset;
            }
            false
        }
    }

    /// Check and mark in one go. Returns true if fresh.
    #[cfg(test)]
    pub fn check_and_update(&mut self, seqno: u64, filter: ReplayFilter) -> bool {
        if !self.is_acceptable(seqno, filter) {
            return false;
        }
        self.mark_read(seqno);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: ReplayFilter = ReplayFilter::Strict;

    #[test]
    fn accepts_fresh_and_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(1, STRICT));
        assert!(!w.check_and_update(1, STRICT)); // duplicate
        assert!(w.check_and_update(2, STRICT)); // next fresh
    }

    #[test]
    fn accepts_sequence_zero_first() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(0, STRICT));
        assert!(!w.check_and_update(0, STRICT));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(10, STRICT)); // establish max=10
        assert!(w.check_and_update(8, STRICT)); // unseen within 64
        assert!(!w.check_and_update(8, STRICT)); // duplicate now
        assert!(w.check_and_update(9, STRICT)); // unseen within 64
    }

    #[test]
    fn rejects_too_old() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(100, STRICT));
        // offset = 64 -> too old
        assert!(!w.check_and_update(36, STRICT));
        // offset = 63 -> allowed once
        assert!(w.check_and_update(37, STRICT));
        assert!(!w.check_and_update(37, STRICT));
    }

    #[test]
    fn window_mode_lets_old_records_pass() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(100, ReplayFilter::Window));
        assert!(w.is_acceptable(2, ReplayFilter::Window));
        assert!(!w.is_acceptable(2, STRICT));
        // duplicates inside the window are still caught
        assert!(!w.is_acceptable(100, ReplayFilter::Window));
    }

    #[test]
    fn off_accepts_everything() {
        let mut w = ReplayWindow::new();
        w.mark_read(5);
        assert!(w.is_acceptable(5, ReplayFilter::Off));
    }

    #[test]
    fn checking_does_not_mark() {
        let mut w = ReplayWindow::new();
        w.mark_read(3);
        assert!(w.is_acceptable(4, STRICT));
        assert!(w.is_acceptable(4, STRICT));
        assert!(w.mark_read(4));
        assert!(!w.is_acceptable(4, STRICT));
    }

    #[test]
    fn mark_reports_newest() {
        let mut w = ReplayWindow::new();
        assert!(w.mark_read(10));
        assert!(!w.mark_read(9));
        assert!(w.mark_read(11));
    }

    #[test]
    fn handles_large_jump_and_window_shift() {
        let mut w = ReplayWindow::new();
        assert!(w.check_and_update(1, STRICT));
        assert!(w.check_and_update(80, STRICT));
        // Within window of new max and unseen
        assert!(w.check_and_update(79, STRICT));
        // Too old relative to new max
        assert!(!w.check_and_update(15, STRICT));
    }
}
