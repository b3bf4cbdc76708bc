//! Sniff mode transition guard for BR/EDR links
//!
//! Mode changes are slow controller round trips. A request made while a
//! matching transition is still inside its window is not sent again.

use crate::conn::types::BtMode;
use crate::error::{ConnError, ConnResult};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct SniffState {
    pub mode: BtMode,
    /// Set while an enter-sniff command is outstanding
    pub entering: Option<Instant>,
    /// Set while an exit-sniff command is outstanding
    pub exiting: Option<Instant>,
}

impl Default for SniffState {
    fn default() -> Self {
        Self::new()
    }
}

fn within(started: Option<Instant>, now: Instant, window: Duration) -> bool {
    started.is_some_and(|at| now.saturating_duration_since(at) < window)
}

impl SniffState {
    pub fn new() -> Self {
        Self {
            mode: BtMode::Active,
            entering: None,
            exiting: None,
        }
    }

    /// Decide whether an enter-sniff command should go out
    ///
    /// Returns `Ok(false)` when the link is already in sniff or an entry
    /// attempt is still running.
    pub fn request_entry(&mut self, now: Instant, window: Duration) -> ConnResult<bool> {
        if self.mode == BtMode::Sniff {
            return Ok(false);
        }
        if within(self.entering, now, window) {
            return Ok(false);
        }
        self.entering = Some(now);
        Ok(true)
    }

    /// Decide whether an exit-sniff command should go out
    pub fn request_exit(&mut self, now: Instant, window: Duration) -> ConnResult<bool> {
        if self.mode == BtMode::Active && self.entering.is_none() {
            return Err(ConnError::Already);
        }
        // The controller cannot leave sniff halfway into it
        if within(self.entering, now, window) {
            return Err(ConnError::Busy);
        }
        if within(self.exiting, now, window) {
            return Err(ConnError::Busy);
        }
        self.exiting = Some(now);
        Ok(true)
    }

    /// Undo a request whose command never reached the controller
    pub fn abort_entry(&mut self) {
        self.entering = None;
    }

    pub fn abort_exit(&mut self) {
        self.exiting = None;
    }

    /// Mode Change event from the controller
    pub fn mode_changed(&mut self, mode: BtMode) {
        self.mode = mode;
        self.entering = None;
        self.exiting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(2000);

    #[test]
    fn test_entry_is_sent_once_per_window() {
        let mut sniff = SniffState::new();
        let t0 = Instant::now();
        assert!(sniff.request_entry(t0, WINDOW).unwrap());
        assert!(!sniff.request_entry(t0 + Duration::from_millis(500), WINDOW).unwrap());

        // Window expired without a mode change: try again
        assert!(sniff.request_entry(t0 + WINDOW, WINDOW).unwrap());

        sniff.mode_changed(BtMode::Sniff);
        assert!(sniff.entering.is_none());
        assert!(!sniff.request_entry(t0 + WINDOW * 3, WINDOW).unwrap());
    }

    #[test]
    fn test_exit_from_active_is_already() {
        let mut sniff = SniffState::new();
        assert!(matches!(
            sniff.request_exit(Instant::now(), WINDOW),
            Err(ConnError::Already)
        ));
    }

    #[test]
    fn test_exit_during_entry_is_busy() {
        let mut sniff = SniffState::new();
        let t0 = Instant::now();
        sniff.request_entry(t0, WINDOW).unwrap();
        assert!(matches!(
            sniff.request_exit(t0 + Duration::from_millis(10), WINDOW),
            Err(ConnError::Busy)
        ));

        // A stale entry attempt no longer blocks the exit
        assert!(sniff.request_exit(t0 + WINDOW, WINDOW).unwrap());
    }

    #[test]
    fn test_repeated_exit_is_busy() {
        let mut sniff = SniffState::new();
        sniff.mode_changed(BtMode::Sniff);
        let t0 = Instant::now();
        assert!(sniff.request_exit(t0, WINDOW).unwrap());
        assert!(matches!(
            sniff.request_exit(t0 + Duration::from_millis(100), WINDOW),
            Err(ConnError::Busy)
        ));

        sniff.mode_changed(BtMode::Active);
        assert!(sniff.exiting.is_none());
        assert_eq!(sniff.mode, BtMode::Active);
    }
}
