//! Batch pacing and totals for the load test.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use echokit_core::SaturatingCounter;
use tokio::sync::mpsc;

use crate::session::ClientSession;

/// Aggregate results across every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub sessions_connected: SaturatingCounter,
    pub bytes_written: SaturatingCounter,
    pub bytes_read: SaturatingCounter,
}

impl Totals {
    pub fn print(&self) {
        println!("Total sessions connected: {}", self.sessions_connected);
        println!("Total bytes written     : {}", self.bytes_written);
        println!("Total bytes read        : {}", self.bytes_read);
    }
}

/// Start work items in batches of `batch_size`, pausing `interval`
/// between batches.
pub async fn pace_batches<F>(total: usize, batch_size: usize, interval: Duration, mut launch: F)
where
    F: FnMut(usize),
{
    let batch_size = batch_size.max(1);
    let mut started = 0;
    while started < total {
        let end = (started + batch_size).min(total);
        for index in started..end {
            launch(index);
        }
        started = end;
        if started < total && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
}

/// Run the whole load test: batched connects, echo until the test
/// duration elapses (or every session finishes, or Ctrl+C), then stop
/// everything and collect totals.
pub async fn run_load(
    sessions: Vec<Arc<ClientSession>>,
    endpoints: Arc<Vec<SocketAddr>>,
    batch_size: usize,
    batch_interval: Duration,
    test_duration: Duration,
) -> Totals {
    let connected = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    let launch = |index: usize| {
        let session = Arc::clone(&sessions[index]);
        let endpoints = Arc::clone(&endpoints);
        let connected = Arc::clone(&connected);
        let done_tx = done_tx.clone();
        let session_for_run = Arc::clone(&session);
        session.connect(endpoints, move |result| match result {
            Ok(()) => {
                connected.fetch_add(1, Ordering::Relaxed);
                let done_tx = done_tx.clone();
                session_for_run.run(move |_result| {
                    let _ = done_tx.send(());
                });
            }
            Err(error) => {
                tracing::debug!(%error, "session failed to connect");
                let _ = done_tx.send(());
            }
        });
    };

    let total = sessions.len();
    let pacing = pace_batches(total, batch_size, batch_interval, launch);

    let all_finished = async {
        let mut finished = 0usize;
        while finished < total {
            if done_rx.recv().await.is_none() {
                break;
            }
            finished += 1;
        }
    };

    tokio::select! {
        _ = async { pacing.await; all_finished.await } => {
            tracing::info!("every session finished before the time limit");
        }
        _ = tokio::time::sleep(test_duration) => {
            tracing::info!(secs = test_duration.as_secs(), "test duration elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping sessions");
        }
    }

    // Stop everything and wait for the stops to land.
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<()>();
    for session in &sessions {
        let stopped_tx = stopped_tx.clone();
        session.stop(move |()| {
            let _ = stopped_tx.send(());
        });
    }
    drop(stopped_tx);
    let drain = async {
        let mut stopped = 0usize;
        while stopped < total {
            if stopped_rx.recv().await.is_none() {
                break;
            }
            stopped += 1;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("some sessions did not stop in time");
    }

    let mut totals = Totals::default();
    totals
        .sessions_connected
        .add(connected.load(Ordering::Relaxed) as u64);
    for session in &sessions {
        let session_totals = session.totals();
        totals.bytes_written.accumulate(session_totals.bytes_written);
        totals.bytes_read.accumulate(session_totals.bytes_read);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn batches_are_spaced_by_the_interval() {
        let starts = std::sync::Mutex::new(Vec::new());
        pace_batches(10, 3, Duration::from_millis(500), |index| {
            starts.lock().unwrap().push((index, tokio::time::Instant::now()));
        })
        .await;

        let starts = starts.into_inner().unwrap();
        assert_eq!(starts.len(), 10);

        // Four batches: 3 + 3 + 3 + 1.
        let batch_heads: Vec<_> = starts
            .iter()
            .filter(|(index, _)| index % 3 == 0)
            .map(|(_, at)| *at)
            .collect();
        assert_eq!(batch_heads.len(), 4);
        for pair in batch_heads.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }

        // Everything inside one batch starts at the same instant.
        assert_eq!(starts[0].1, starts[2].1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_launches_everything_at_once() {
        let count = std::sync::Mutex::new(0usize);
        let begun = tokio::time::Instant::now();
        pace_batches(7, 2, Duration::ZERO, |_| {
            *count.lock().unwrap() += 1;
        })
        .await;
        assert_eq!(*count.lock().unwrap(), 7);
        assert_eq!(tokio::time::Instant::now(), begun);
    }
}
