//! `pagebrain` is the cache decision engine for a remote-backed, page-cached
//! block device.
//!
//! A very large virtual block device is backed by a remote object store that
//! only speaks whole-page upload/download. Because round trips to that store
//! are slow, a local page cache sits between the block interface (random
//! access at arbitrary byte offsets) and the remote store (whole-page
//! transfers gated on redundancy). This crate implements the state machine
//! that decides, for any given access, which side effects must run before the
//! access is legal ([`brain`]), the mutex-serialized loop that drives that
//! state machine against real collaborators ([`dispatcher`]), the background
//! thread that reconciles uploads and evicts idle pages ([`maintainer`]), and
//! the pure offset-to-page address translation ([`addressing`]) all three
//! depend on.
//!
//! The remote object store and the local on-disk page store are modeled only
//! as traits ([`collaborators`]); this crate does not ship a production
//! backend for either.

pub mod addressing;
pub mod brain;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod maintainer;

pub use brain::{Action, CacheBrain, PageId, PageState};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use maintainer::Maintainer;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid cache configuration: soft_max_cached ({soft}) must be less than hard_max_cached ({hard})")]
    ConfigInvalid { soft: usize, hard: usize },

    #[error("remote store failure for page {page}: {source}")]
    RemoteFailure {
        page: PageId,
        #[source]
        source: std::io::Error,
    },

    #[error("local page file failure for page {page}: {source}")]
    LocalIoFailure {
        page: PageId,
        #[source]
        source: std::io::Error,
    },

    #[error("config file error")]
    ConfigFormat(#[from] toml::de::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),
}
