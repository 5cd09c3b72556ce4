//! The cache decision engine.
//!
//! `CacheBrain` is a pure state machine: it owns a fixed table of per-page
//! metadata and, in response to the three stimuli below, returns the list of
//! [`Action`]s the dispatcher must execute before the requested access (or
//! shutdown) is legal. It performs no I/O itself and holds no lock of its
//! own — the dispatcher is responsible for serializing calls into it.

use std::fmt;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Index into the fixed page table. One page covers `page_size` bytes of the
/// virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(id: u64) -> Self {
        PageId(id)
    }
}

impl From<PageId> for u64 {
    fn from(id: PageId) -> Self {
        id.0
    }
}

/// The five states a page can be in. See the module-level cache aggregate
/// invariants: a page is "cached" (counts against `cache_count`) in every
/// state but `Zero` and `NotCached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Zero,
    NotCached,
    CachedUnchanged,
    CachedChanged,
    CachedUploading,
}

impl PageState {
    fn is_cached(self) -> bool {
        matches!(
            self,
            PageState::CachedUnchanged | PageState::CachedChanged | PageState::CachedUploading
        )
    }
}

/// The side effects the dispatcher must perform, in order, before an access
/// (or shutdown step) is complete. Every variant but `WaitAndRetry` carries
/// the page it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ZeroCache(PageId),
    DeleteCache(PageId),
    Download(PageId),
    StartUpload(PageId),
    CancelUpload(PageId),
    OpenFile(PageId),
    CloseFile(PageId),
    /// Not an error: a control token asking the dispatcher to release its
    /// lock, sleep, and re-invoke the brain.
    WaitAndRetry,
}

#[derive(Debug, Clone, Copy)]
struct PageMeta {
    state: PageState,
    last_access: Option<Instant>,
    last_write_access: Option<Instant>,
}

impl PageMeta {
    fn fresh() -> Self {
        PageMeta {
            state: PageState::Zero,
            last_access: None,
            last_write_access: None,
        }
    }
}

/// The cache decision engine. See the crate-level docs for the surrounding
/// system; this type implements §4.2 of the design in isolation.
#[derive(Debug)]
pub struct CacheBrain {
    hard_max_cached: usize,
    soft_max_cached: usize,
    idle_interval: Duration,
    cache_count: usize,
    pages: Vec<PageMeta>,
}

impl CacheBrain {
    /// Allocate a fresh brain with every page in state `Zero`.
    ///
    /// Fails with [`Error::ConfigInvalid`] if `soft_max_cached >=
    /// hard_max_cached`.
    pub fn new(
        page_count: u64,
        hard_max_cached: usize,
        soft_max_cached: usize,
        idle_interval: Duration,
    ) -> Result<Self> {
        if soft_max_cached >= hard_max_cached {
            return Err(Error::ConfigInvalid {
                soft: soft_max_cached,
                hard: hard_max_cached,
            });
        }

        Ok(CacheBrain {
            hard_max_cached,
            soft_max_cached,
            idle_interval,
            cache_count: 0,
            pages: vec![PageMeta::fresh(); page_count as usize],
        })
    }

    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    pub fn cache_count(&self) -> usize {
        self.cache_count
    }

    pub fn hard_max_cached(&self) -> usize {
        self.hard_max_cached
    }

    pub fn soft_max_cached(&self) -> usize {
        self.soft_max_cached
    }

    pub fn page_state(&self, page: PageId) -> PageState {
        self.pages[page.0 as usize].state
    }

    pub fn last_access(&self, page: PageId) -> Option<Instant> {
        self.pages[page.0 as usize].last_access
    }

    pub fn last_write_access(&self, page: PageId) -> Option<Instant> {
        self.pages[page.0 as usize].last_write_access
    }

    /// §4.2.1 — what must happen before `page` may be read (`is_write =
    /// false`) or written (`is_write = true`).
    pub fn prepare_access(&mut self, page: PageId, is_write: bool, now: Instant) -> Vec<Action> {
        let state = self.page_state(page);

        if !state.is_cached() && self.cache_count >= self.hard_max_cached {
            let mut actions = self.maintenance(now);
            actions.push(Action::WaitAndRetry);
            return actions;
        }

        let mut actions = Vec::new();

        match state {
            PageState::Zero => {
                actions.push(Action::ZeroCache(page));
                self.set_state(page, PageState::CachedChanged);
                self.cache_count += 1;
            }
            PageState::NotCached => {
                actions.push(Action::OpenFile(page));
                actions.push(Action::Download(page));
                let new_state = if is_write {
                    PageState::CachedChanged
                } else {
                    PageState::CachedUnchanged
                };
                self.set_state(page, new_state);
                self.cache_count += 1;
            }
            PageState::CachedUnchanged => {
                if is_write {
                    self.set_state(page, PageState::CachedChanged);
                }
            }
            PageState::CachedChanged => {}
            PageState::CachedUploading => {
                if is_write {
                    actions.push(Action::CancelUpload(page));
                    self.set_state(page, PageState::CachedChanged);
                }
            }
        }

        let meta = &mut self.pages[page.0 as usize];
        meta.last_access = Some(now);
        if is_write {
            meta.last_write_access = Some(now);
        }

        actions
    }

    /// §4.2.2 — idle-flush followed by at most one eviction step.
    pub fn maintenance(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut started_upload = false;
        let mut victim: Option<usize> = None;
        let mut victim_access: Option<Instant> = None;

        for idx in 0..self.pages.len() {
            let meta = self.pages[idx];

            if meta.state == PageState::CachedChanged {
                let idle_since = meta
                    .last_write_access
                    .map(|t| now > t + self.idle_interval)
                    .unwrap_or(false);
                if idle_since {
                    actions.push(Action::StartUpload(PageId(idx as u64)));
                    self.pages[idx].state = PageState::CachedUploading;
                    started_upload = true;
                }
            }

            // Re-read state: it may have just flipped to CachedUploading above,
            // which is still a cached state eligible as an eviction victim.
            let state = self.pages[idx].state;
            if state.is_cached() {
                let la = self.pages[idx].last_access;
                if victim.is_none() || la < victim_access {
                    victim = Some(idx);
                    victim_access = la;
                }
            }
        }

        if started_upload || self.cache_count < self.soft_max_cached {
            return actions;
        }

        if let Some(idx) = victim {
            let page = PageId(idx as u64);
            match self.pages[idx].state {
                PageState::CachedUnchanged => {
                    actions.push(Action::DeleteCache(page));
                    actions.push(Action::CloseFile(page));
                    self.pages[idx].state = PageState::NotCached;
                    self.cache_count -= 1;
                }
                PageState::CachedChanged => {
                    actions.push(Action::StartUpload(page));
                    self.pages[idx].state = PageState::CachedUploading;
                }
                PageState::CachedUploading => {
                    // Already on its way out; nothing more to do.
                }
                PageState::Zero | PageState::NotCached => unreachable!(
                    "eviction victim {page} tracked only while its state is_cached()"
                ),
            }
        }

        actions
    }

    /// §4.2.3 — drive every page to a quiescent terminal state. The
    /// dispatcher should call this in a loop until it returns an empty list.
    pub fn prepare_shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();

        for idx in 0..self.pages.len() {
            if self.pages[idx].state == PageState::CachedChanged {
                let page = PageId(idx as u64);
                actions.push(Action::StartUpload(page));
                self.pages[idx].state = PageState::CachedUploading;
            }
        }

        for idx in 0..self.pages.len() {
            if self.pages[idx].state == PageState::CachedUnchanged {
                let page = PageId(idx as u64);
                actions.push(Action::DeleteCache(page));
                actions.push(Action::CloseFile(page));
                self.pages[idx].state = PageState::NotCached;
                self.cache_count -= 1;
            }
        }

        let any_uploading = self
            .pages
            .iter()
            .any(|meta| meta.state == PageState::CachedUploading);
        if any_uploading {
            actions.push(Action::WaitAndRetry);
        }

        actions
    }

    /// Startup-only: mark a page known-uploaded at the remote with no local
    /// copy. No-op unless the page is currently `Zero`.
    pub fn overlay_not_cached(&mut self, page: PageId) {
        if self.page_state(page) == PageState::Zero {
            self.set_state(page, PageState::NotCached);
        }
    }

    /// Startup-only: mark a page that has a residual local file as
    /// conservatively changed (the local copy is assumed newer than remote).
    /// No-op unless the page is currently `Zero` or `NotCached`.
    pub fn overlay_cached_changed(&mut self, page: PageId) {
        let state = self.page_state(page);
        if state == PageState::Zero || state == PageState::NotCached {
            self.set_state(page, PageState::CachedChanged);
            self.cache_count += 1;
        }
    }

    /// Background-maintainer-only: the remote store has confirmed `page`'s
    /// upload meets the redundancy threshold. No-op unless the page is still
    /// `CachedUploading` (a write may have cancelled it in the meantime).
    pub fn confirm_upload(&mut self, page: PageId) {
        if self.page_state(page) == PageState::CachedUploading {
            self.set_state(page, PageState::CachedUnchanged);
        }
    }

    fn set_state(&mut self, page: PageId, state: PageState) {
        self.pages[page.0 as usize].state = state;
    }
}
