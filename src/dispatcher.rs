//! The mutex-serialized loop that consults the [`CacheBrain`] before every
//! access and executes the actions it returns against the boundary
//! collaborators.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use tracing::{debug, trace};

use crate::addressing::{determine_pages, PageAccess};
use crate::brain::{Action, CacheBrain, PageId, PageState};
use crate::collaborators::{LocalPageStore, RemoteStore};
use crate::config::Config;
use crate::{Error, Result};

struct Inner<L: LocalPageStore> {
    brain: CacheBrain,
    handles: HashMap<PageId, L::Handle>,
}

/// Serializes brain consultations and collaborator I/O behind one mutex, per
/// §4.3 and §5 of the design: the mutex is the sole concurrency primitive,
/// and it is released during every sleep so other callers and the
/// background maintainer can make progress.
pub struct Dispatcher<R: RemoteStore, L: LocalPageStore> {
    config: Config,
    remote: R,
    local: L,
    inner: Mutex<Inner<L>>,
}

impl<R: RemoteStore, L: LocalPageStore> Dispatcher<R, L> {
    /// Build a dispatcher and perform the one-time startup reconciliation
    /// (§3, Lifecycle): pages the remote already has become `NotCached`,
    /// pages with a residual local file become `CachedChanged`.
    pub fn recover(config: Config, remote: R, local: L) -> Result<Self> {
        config.validate()?;

        let mut brain = CacheBrain::new(
            config.page_count(),
            config.hard_max_cached,
            config.soft_max_cached,
            config.idle_interval(),
        )?;

        for page in remote
            .list_uploaded(false)
            .map_err(|source| remote_err(PageId(0), source))?
        {
            brain.overlay_not_cached(page);
        }

        // The residual-local-file overlay is applied last so it wins over
        // the remote overlay when both would apply to the same page (see
        // §4.2.4 and the "overlay precedence" design note).
        for page in local
            .residual_pages()
            .map_err(|source| local_err(PageId(0), source))?
        {
            brain.overlay_cached_changed(page);
        }

        debug!(
            page_count = brain.page_count(),
            cache_count = brain.cache_count(),
            "dispatcher recovered from boundary collaborators"
        );

        Ok(Dispatcher {
            config,
            remote,
            local,
            inner: Mutex::new(Inner {
                brain,
                handles: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of the brain's current cache occupancy. Callers must not
    /// rely on this being fresh by the time they act on it; it exists for
    /// observability, not control flow.
    pub fn cache_count(&self) -> usize {
        self.inner.lock().unwrap().brain.cache_count()
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let accesses = determine_pages(offset, buf.len() as u64, self.config.page_size);
        let mut inner = self.inner.lock().unwrap();
        let mut total = 0usize;

        for access in &accesses {
            inner = self.admit(inner, access, false)?;

            let slice = &mut buf[access.buf_low as usize..access.buf_high as usize];
            let handle = inner
                .handles
                .get(&access.page)
                .expect("admit() leaves a local handle open for the accessed page");
            let n = self
                .local
                .read_at(handle, slice, access.page_offset)
                .map_err(|source| local_err(access.page, source))?;
            total += n;
        }

        Ok(total)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let accesses = determine_pages(offset, buf.len() as u64, self.config.page_size);
        let mut inner = self.inner.lock().unwrap();

        let throttle_level = inner.brain.cache_count() as i64
            - (self.config.soft_max_cached + self.remote.max_concurrent_uploads()) as i64;
        if throttle_level >= 0 {
            drop(inner);
            let sleep_for = self.config.write_throttle_interval() * 2u32.pow(throttle_level as u32);
            trace!(throttle_level, ?sleep_for, "throttling write under cache pressure");
            thread::sleep(sleep_for);
            inner = self.inner.lock().unwrap();
        }

        let mut total = 0usize;

        for access in &accesses {
            inner = self.admit(inner, access, true)?;

            let slice = &buf[access.buf_low as usize..access.buf_high as usize];
            let handle = inner
                .handles
                .get(&access.page)
                .expect("admit() leaves a local handle open for the accessed page");
            let n = self
                .local
                .write_at(handle, slice, access.page_offset)
                .map_err(|source| local_err(access.page, source))?;
            total += n;
        }

        Ok(total)
    }

    /// Drive `prepare_access` to completion for one page access, retrying
    /// through `WaitAndRetry` as needed, and return the (possibly
    /// re-acquired) lock guard.
    fn admit<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, Inner<L>>,
        access: &PageAccess,
        is_write: bool,
    ) -> Result<std::sync::MutexGuard<'a, Inner<L>>> {
        loop {
            let now = Instant::now();
            let actions = inner.brain.prepare_access(access.page, is_write, now);
            let must_wait = matches!(actions.last(), Some(Action::WaitAndRetry));

            debug!(page = %access.page, is_write, ?actions, "prepare_access");
            self.execute_actions(&mut inner, &actions)?;

            if !must_wait {
                return Ok(inner);
            }

            drop(inner);
            trace!(page = %access.page, "cache at hard limit, waiting before retry");
            thread::sleep(self.config.wait_interval());
            inner = self.inner.lock().unwrap();
        }
    }

    /// Execute a batch of actions in order against the boundary
    /// collaborators. `WaitAndRetry` is a control token the caller already
    /// inspected, not something the executor performs.
    fn execute_actions(&self, inner: &mut Inner<L>, actions: &[Action]) -> Result<()> {
        for action in actions {
            match *action {
                Action::ZeroCache(page) => {
                    let handle = self.local.open(page).map_err(|e| local_err(page, e))?;
                    self.local
                        .zero_fill(&handle, self.config.page_size)
                        .map_err(|e| local_err(page, e))?;
                    inner.handles.insert(page, handle);
                }
                Action::OpenFile(page) => {
                    let handle = self.local.open(page).map_err(|e| local_err(page, e))?;
                    inner.handles.insert(page, handle);
                }
                Action::Download(page) => {
                    let path = self.local.path_for(page);
                    self.remote
                        .download(page, &path)
                        .map_err(|e| remote_err(page, e))?;
                    if !inner.handles.contains_key(&page) {
                        let handle = self.local.open(page).map_err(|e| local_err(page, e))?;
                        inner.handles.insert(page, handle);
                    }
                }
                Action::StartUpload(page) => {
                    let path = self.local.path_for(page);
                    self.remote
                        .upload(page, &path)
                        .map_err(|e| remote_err(page, e))?;
                }
                Action::CancelUpload(page) => {
                    self.remote.delete(page).map_err(|e| remote_err(page, e))?;
                }
                Action::DeleteCache(page) => {
                    self.local.remove(page).map_err(|e| local_err(page, e))?;
                }
                Action::CloseFile(page) => {
                    if let Some(handle) = inner.handles.remove(&page) {
                        self.local.close(handle).map_err(|e| local_err(page, e))?;
                    }
                }
                Action::WaitAndRetry => {}
            }
        }
        Ok(())
    }

    /// Drain the brain through `prepare_shutdown` until it returns no more
    /// actions, then stop. Intended to be called once, before the
    /// background maintainer thread is signalled to stop.
    pub fn shutdown(&self) -> Result<()> {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let actions = inner.brain.prepare_shutdown();
            if actions.is_empty() {
                return Ok(());
            }

            let must_wait = matches!(actions.last(), Some(Action::WaitAndRetry));
            debug!(?actions, "prepare_shutdown");
            self.execute_actions(&mut inner, &actions)?;
            drop(inner);

            if must_wait {
                self.reconcile_uploads()?;
                thread::sleep(self.config.wait_interval());
            }
        }
    }

    /// Ask the remote store which in-flight uploads now meet the redundancy
    /// threshold, and confirm them in the brain. Called by the background
    /// maintainer, and opportunistically during shutdown so draining
    /// doesn't stall on a page whose upload has, in fact, already landed.
    pub fn reconcile_uploads(&self) -> Result<()> {
        let confirmed = self
            .remote
            .list_uploaded(true)
            .map_err(|e| remote_err(PageId(0), e))?;
        if confirmed.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        for page in confirmed {
            if inner.brain.page_state(page) == PageState::CachedUploading {
                inner.brain.confirm_upload(page);
                debug!(%page, "upload confirmed at redundancy threshold");
            }
        }
        Ok(())
    }

    /// Run one maintenance pass (idle flush + at most one eviction step)
    /// and execute the resulting actions. Called by the background
    /// maintainer on its fixed tick.
    pub fn run_maintenance(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let actions = inner.brain.maintenance(Instant::now());
        if !actions.is_empty() {
            debug!(?actions, "maintenance");
        }
        self.execute_actions(&mut inner, &actions)
    }
}

fn remote_err(page: PageId, source: std::io::Error) -> Error {
    Error::RemoteFailure { page, source }
}

fn local_err(page: PageId, source: std::io::Error) -> Error {
    Error::LocalIoFailure { page, source }
}
