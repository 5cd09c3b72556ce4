//! The background maintainer: a dedicated OS thread that ticks the brain's
//! idle-flush/eviction pass and reconciles confirmed uploads, independently
//! of any caller driving reads or writes.
//!
//! This is deliberately a plain [`std::thread`], not a `tokio` task: the
//! crate has exactly one long-lived background loop, it spends nearly all
//! its time asleep, and a dedicated thread keeps its lifecycle (start once,
//! signal to stop, join) trivial to reason about without pulling in an
//! async runtime for one loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, trace};

use crate::collaborators::{LocalPageStore, RemoteStore};
use crate::dispatcher::Dispatcher;

/// Owns the background thread's lifecycle. Dropping this without calling
/// [`Maintainer::stop`] leaves the thread running detached; `stop` is the
/// intended shutdown path and should be called after the dispatcher has
/// drained via [`Dispatcher::shutdown`].
pub struct Maintainer {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Maintainer {
    /// Spawn the background thread against `dispatcher`, ticking every
    /// `wait_interval` per the dispatcher's configuration.
    pub fn spawn<R, L>(dispatcher: Arc<Dispatcher<R, L>>) -> Self
    where
        R: RemoteStore + 'static,
        L: LocalPageStore + 'static,
        L::Handle: 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop_flag = stop_flag.clone();

        let handle = thread::spawn(move || {
            let wait_interval = dispatcher.config().wait_interval();

            while !thread_stop_flag.load(Ordering::Relaxed) {
                thread::sleep(wait_interval);
                if thread_stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(err) = dispatcher.run_maintenance() {
                    error!(%err, "maintenance pass failed");
                }
                if let Err(err) = dispatcher.reconcile_uploads() {
                    error!(%err, "upload reconciliation failed");
                }
                trace!("maintainer tick complete");
            }
        });

        Maintainer {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background thread to stop after its current tick and
    /// block until it exits. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::{MemoryLocalStore, MemoryRemoteStore};
    use crate::config::Config;
    use std::time::Duration;

    #[test]
    fn maintainer_starts_and_stops_cleanly() {
        let config = Config {
            device_size: 4096 * 4,
            page_size: 4096,
            hard_max_cached: 4,
            soft_max_cached: 2,
            wait_interval_secs: 0,
            ..Config::default()
        };
        let dispatcher = Arc::new(
            Dispatcher::recover(config, MemoryRemoteStore::new(), MemoryLocalStore::new().unwrap()).unwrap(),
        );

        let mut maintainer = Maintainer::spawn(dispatcher.clone());
        thread::sleep(Duration::from_millis(20));
        maintainer.stop();
    }

    #[test]
    fn maintainer_uploads_idle_pages_in_the_background() {
        let config = Config {
            device_size: 4096 * 4,
            page_size: 4096,
            hard_max_cached: 4,
            soft_max_cached: 2,
            idle_interval_secs: 0,
            wait_interval_secs: 0,
            ..Config::default()
        };
        let remote = MemoryRemoteStore::new();
        let dispatcher = Arc::new(
            Dispatcher::recover(config, remote, MemoryLocalStore::new().unwrap()).unwrap(),
        );
        dispatcher.write_at(&[1u8; 10], 0).unwrap();

        let mut maintainer = Maintainer::spawn(dispatcher.clone());
        thread::sleep(Duration::from_millis(50));
        maintainer.stop();

        // The mock remote confirms redundancy the instant an upload lands,
        // so by now the page should have gone all the way from
        // CachedChanged through CachedUploading to CachedUnchanged, still
        // counted as cached.
        assert_eq!(dispatcher.cache_count(), 1);
    }
}
