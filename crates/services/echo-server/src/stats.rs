//! Session-manager statistics.

use std::fmt;

use echokit_core::{SaturatingCounter, ServerError};
use parking_lot::Mutex;

/// Snapshot of the manager's counters.
///
/// `active`, `max_active` and `recycled` mirror list sizes; the remaining
/// counters are monotonic over the manager's lifetime and saturate rather
/// than wrap.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ManagerStats {
    /// Sessions currently in the active list.
    pub active: usize,

    /// High-water mark of `active`.
    pub max_active: usize,

    /// Session wrappers currently pooled for reuse.
    pub recycled: usize,

    /// Successful accepts over the manager's lifetime.
    pub total_accepted: SaturatingCounter,

    /// Sessions stopped on the manager's initiative.
    pub active_shutdowned: SaturatingCounter,

    /// Sessions stopped because no work remained.
    pub out_of_work: SaturatingCounter,

    /// Sessions stopped by the inactivity timer.
    pub timed_out: SaturatingCounter,

    /// Sessions stopped by any other error.
    pub error_stopped: SaturatingCounter,
}

impl fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Active sessions            : {}", self.active)?;
        writeln!(f, "Maximum of active sessions : {}", self.max_active)?;
        writeln!(f, "Recycled sessions          : {}", self.recycled)?;
        writeln!(f, "Total accepted sessions    : {}", self.total_accepted)?;
        writeln!(f, "Active shutdowned sessions : {}", self.active_shutdowned)?;
        writeln!(f, "Out of work sessions       : {}", self.out_of_work)?;
        writeln!(f, "Timed out sessions         : {}", self.timed_out)?;
        write!(f, "Error stopped sessions     : {}", self.error_stopped)
    }
}

/// Mutex-guarded collector shared between the manager strand and the
/// operator threads reading snapshots.
#[derive(Default)]
pub struct StatsCollector {
    stats: Mutex<ManagerStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ManagerStats {
        self.stats.lock().clone()
    }

    pub fn set_active_session_count(&self, count: usize) {
        let mut stats = self.stats.lock();
        stats.active = count;
        if stats.max_active < count {
            stats.max_active = count;
        }
    }

    pub fn set_recycled_session_count(&self, count: usize) {
        self.stats.lock().recycled = count;
    }

    pub fn session_accepted(&self, success: bool) {
        if success {
            self.stats.lock().total_accepted.inc();
        }
    }

    /// Categorise a finished session by the error its wait reported.
    pub fn session_stopped(&self, reason: &ServerError) {
        let mut stats = self.stats.lock();
        match reason {
            ServerError::OperationAborted => stats.active_shutdowned.inc(),
            ServerError::OutOfWork => stats.out_of_work.inc(),
            ServerError::InactivityTimeout => stats.timed_out.inc(),
            _ => stats.error_stopped.inc(),
        }
    }

    pub fn reset(&self) {
        *self.stats.lock() = ManagerStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn active_tracks_high_water_mark() {
        let collector = StatsCollector::new();
        collector.set_active_session_count(3);
        collector.set_active_session_count(1);
        let stats = collector.snapshot();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.max_active, 3);
    }

    #[test]
    fn stop_reasons_land_in_their_counters() {
        let collector = StatsCollector::new();
        collector.session_stopped(&ServerError::OperationAborted);
        collector.session_stopped(&ServerError::OutOfWork);
        collector.session_stopped(&ServerError::OutOfWork);
        collector.session_stopped(&ServerError::InactivityTimeout);
        collector.session_stopped(&ServerError::io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        )));

        let stats = collector.snapshot();
        assert_eq!(stats.active_shutdowned.value(), 1);
        assert_eq!(stats.out_of_work.value(), 2);
        assert_eq!(stats.timed_out.value(), 1);
        assert_eq!(stats.error_stopped.value(), 1);
    }

    #[test]
    fn only_successful_accepts_count() {
        let collector = StatsCollector::new();
        collector.session_accepted(true);
        collector.session_accepted(false);
        assert_eq!(collector.snapshot().total_accepted.value(), 1);
    }

    #[test]
    fn display_lists_all_eight_counters() {
        let collector = StatsCollector::new();
        collector.session_accepted(true);
        let rendered = collector.snapshot().to_string();
        assert_eq!(rendered.lines().count(), 8);
        assert!(rendered.contains("Total accepted sessions    : 1"));
    }
}
