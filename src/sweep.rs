//! Periodic garbage-collection sweep (§5 "periodic sweep", in addition to
//! the on-first-touch sweep `Network::ensure_sandbox` already does). Scoped
//! to a single recurring task — "sweep every stale sandbox namespace" — but
//! built on `periodic::MinInstantHeap` so a future second periodic task
//! (key-rotation reclaim, say) could be added to the same background thread
//! without switching scheduling strategy.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::periodic::{MinInstantEntry, MinInstantHeap};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// One tick of the sweep: list+destroy stale sandbox namespaces across the
/// whole host, excluding the networks currently known to the driver. The
/// driver supplies this as a closure over its own `networks` map so `sweep`
/// itself stays free of any `Driver` dependency.
pub trait SweepTarget: Send + Sync + 'static {
    /// Network ids that currently own a live sandbox and must not be swept.
    fn live_network_ids(&self) -> Vec<String>;
}

/// Background GC sweeper. `spawn` starts a dedicated thread that wakes once
/// per `interval` and calls `target.live_network_ids()` then
/// `kal::netns::list_stale`/`destroy` for anything else left over — mirrors
/// `Network::create_sandbox_locked`'s own stale-sweep, run here
/// unconditionally rather than only on next sandbox creation.
pub struct Sweeper {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(target: impl SweepTarget, interval: Duration) -> Self {
        let (shutdown, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("overlay-gc-sweep".into())
            .spawn(move || {
                let mut heap: MinInstantHeap<()> = MinInstantHeap::new();
                heap.push(MinInstantEntry { timestamp: Instant::now() + interval, task: () });

                loop {
                    let next_due = match heap.peek() {
                        Some(entry) => entry.timestamp,
                        None => break,
                    };
                    let now = Instant::now();
                    let wait = next_due.saturating_duration_since(now);
                    match rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            heap.pop();
                            run_sweep(&target);
                            heap.push(MinInstantEntry { timestamp: Instant::now() + interval, task: () });
                        }
                    }
                }
            })
            .expect("failed to spawn gc-sweep thread");

        Sweeper { shutdown, handle: Some(handle) }
    }

    pub fn spawn_default(target: impl SweepTarget) -> Self {
        Self::spawn(target, DEFAULT_INTERVAL)
    }

    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_sweep(target: &impl SweepTarget) {
    let exclude: Vec<String> = target.live_network_ids().iter().map(|nid| format!("ov-{}", short_id(nid))).collect();
    match crate::kal::netns::list_stale(&exclude) {
        Ok(stale) => {
            for name in stale {
                tracing::info!(stale_ns = %name, "periodic sweep destroying stale sandbox");
                if let Err(err) = crate::kal::netns::destroy_by_ns_name(&name) {
                    tracing::warn!(stale_ns = %name, error = %err, "periodic sweep failed to destroy stale sandbox");
                }
            }
        }
        Err(err) => tracing::warn!(error = %err, "periodic sweep failed to list stale sandboxes"),
    }
}

fn short_id(network_id: &str) -> String {
    network_id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTarget(Arc<AtomicUsize>);

    impl SweepTarget for CountingTarget {
        fn live_network_ids(&self) -> Vec<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    #[test]
    fn sweeper_ticks_at_least_once_within_a_short_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(CountingTarget(calls.clone()), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(120));
        sweeper.stop();
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stop_joins_promptly_even_mid_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sweeper = Sweeper::spawn(CountingTarget(calls.clone()), Duration::from_secs(60));
        let start = Instant::now();
        sweeper.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
