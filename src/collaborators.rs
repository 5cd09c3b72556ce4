//! The boundary traits this crate holds against, plus minimal in-memory
//! implementations of each for tests and documentation examples.
//!
//! Production backends — an actual object-store client, an actual file on
//! disk — live outside this crate; see §1 and §6 of the design. What's here
//! is only the contract the [`crate::dispatcher::Dispatcher`] and
//! [`crate::maintainer::Maintainer`] are written against, plus `mock`, a
//! same-process stand-in good enough to drive the whole crate end to end in
//! tests.

use std::io;
use std::path::Path;

use crate::brain::PageId;

/// The remote, content-addressed object store. One "object" per page.
///
/// Methods return plain [`io::Error`]; the dispatcher is responsible for
/// tagging failures with the page they happened against when it turns them
/// into [`crate::Error::RemoteFailure`].
pub trait RemoteStore: Send + Sync {
    /// List pages known to exist at the remote. When `check_redundancy` is
    /// true, only pages whose reported redundancy meets the configured
    /// minimum are returned.
    fn list_uploaded(&self, check_redundancy: bool) -> io::Result<Vec<PageId>>;

    /// Upload the contents of `local_path` as `page`'s remote object.
    fn upload(&self, page: PageId, local_path: &Path) -> io::Result<()>;

    /// Download `page`'s remote object to `local_path`.
    fn download(&self, page: PageId, local_path: &Path) -> io::Result<()>;

    /// Remove `page`'s remote object.
    fn delete(&self, page: PageId) -> io::Result<()>;

    /// How many uploads this store can usefully have in flight at once; the
    /// dispatcher's write throttle is tuned against this.
    fn max_concurrent_uploads(&self) -> usize;
}

/// A single page's file on the local disk.
///
/// Methods return plain [`io::Error`]; the dispatcher tags failures with the
/// page they happened against when it turns them into
/// [`crate::Error::LocalIoFailure`].
pub trait LocalPageStore: Send + Sync {
    type Handle: Send;

    /// Open (creating if necessary) the local file backing `page`.
    fn open(&self, page: PageId) -> io::Result<Self::Handle>;

    /// Close a handle previously returned by `open`.
    fn close(&self, handle: Self::Handle) -> io::Result<()>;

    fn read_at(&self, handle: &Self::Handle, buf: &mut [u8], page_offset: u64) -> io::Result<usize>;

    fn write_at(&self, handle: &Self::Handle, buf: &[u8], page_offset: u64) -> io::Result<usize>;

    /// Write `page_size` zero bytes to `handle`, fully materializing a
    /// virgin page.
    fn zero_fill(&self, handle: &Self::Handle, page_size: u64) -> io::Result<()>;

    /// Remove the on-disk file backing `page` entirely.
    fn remove(&self, page: PageId) -> io::Result<()>;

    /// One-time startup scan: every page with a residual local file, i.e.
    /// one this store already has bytes for despite never having been
    /// `open`ed this process lifetime.
    fn residual_pages(&self) -> io::Result<Vec<PageId>>;

    /// Path the local file for `page` would live at, for collaborators
    /// (like [`RemoteStore::upload`]) that need a filesystem path rather
    /// than a handle.
    fn path_for(&self, page: PageId) -> std::path::PathBuf;
}

/// Same-process, in-memory stand-ins for [`RemoteStore`] and
/// [`LocalPageStore`], used by this crate's own tests and suitable as a
/// starting point for documentation examples. Not a production backend.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory object store keyed by [`PageId`]; redundancy is
    /// recorded per upload and can be adjusted by tests to simulate slow
    /// replication.
    #[derive(Default)]
    pub struct MemoryRemoteStore {
        inner: Mutex<MemoryRemoteInner>,
    }

    #[derive(Default)]
    struct MemoryRemoteInner {
        objects: HashMap<PageId, Vec<u8>>,
        redundancy: HashMap<PageId, f64>,
    }

    impl MemoryRemoteStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed the store with a page as if it had already been uploaded
        /// durably, for constructing startup-reconciliation test fixtures.
        pub fn seed_uploaded(&self, page: PageId, data: Vec<u8>) {
            let mut inner = self.inner.lock().unwrap();
            inner.redundancy.insert(page, 3.0);
            inner.objects.insert(page, data);
        }

        /// Set the reported redundancy for a page already uploaded via
        /// [`RemoteStore::upload`], simulating replication progress.
        pub fn set_redundancy(&self, page: PageId, redundancy: f64) {
            self.inner.lock().unwrap().redundancy.insert(page, redundancy);
        }
    }

    impl RemoteStore for MemoryRemoteStore {
        fn list_uploaded(&self, check_redundancy: bool) -> io::Result<Vec<PageId>> {
            let inner = self.inner.lock().unwrap();
            let pages = inner
                .objects
                .keys()
                .filter(|page| {
                    if check_redundancy {
                        inner.redundancy.get(page).copied().unwrap_or(0.0) >= 2.5
                    } else {
                        true
                    }
                })
                .copied()
                .collect();
            Ok(pages)
        }

        fn upload(&self, page: PageId, local_path: &Path) -> io::Result<()> {
            let data = std::fs::read(local_path)?;
            let mut inner = self.inner.lock().unwrap();
            // A real object store only reports a page as durably uploaded
            // once it has landed on enough replicas; this mock treats every
            // completed upload as immediately past the redundancy
            // threshold, matching `seed_uploaded`, so callers that loop on
            // `list_uploaded(true)` (the background maintainer, shutdown
            // drain) converge.
            inner.redundancy.insert(page, 3.0);
            inner.objects.insert(page, data);
            Ok(())
        }

        fn download(&self, page: PageId, local_path: &Path) -> io::Result<()> {
            let inner = self.inner.lock().unwrap();
            let data = inner.objects.get(&page).cloned().unwrap_or_default();
            drop(inner);
            std::fs::write(local_path, data)?;
            Ok(())
        }

        fn delete(&self, page: PageId) -> io::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.objects.remove(&page);
            inner.redundancy.remove(&page);
            Ok(())
        }

        fn max_concurrent_uploads(&self) -> usize {
            4
        }
    }

    /// An in-memory local page store rooted at a real temporary directory
    /// (local files still need real paths for the `RemoteStore` trait's
    /// `local_path` arguments), tracking which pages already had a file on
    /// disk when it was constructed.
    pub struct MemoryLocalStore {
        dir: tempfile::TempDir,
        residual: Vec<PageId>,
    }

    impl MemoryLocalStore {
        pub fn new() -> std::io::Result<Self> {
            Ok(MemoryLocalStore {
                dir: tempfile::tempdir()?,
                residual: Vec::new(),
            })
        }

        /// Start a store that looks, from the brain's perspective, like it
        /// survived a restart with `page`'s file already present on disk.
        pub fn with_residual_file(page: PageId, contents: &[u8]) -> std::io::Result<Self> {
            let dir = tempfile::tempdir()?;
            std::fs::write(dir.path().join(format!("page{}", page.0)), contents)?;
            Ok(MemoryLocalStore {
                dir,
                residual: vec![page],
            })
        }
    }

    impl LocalPageStore for MemoryLocalStore {
        type Handle = std::fs::File;

        fn open(&self, page: PageId) -> io::Result<Self::Handle> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(self.path_for(page))?;
            Ok(file)
        }

        fn close(&self, handle: Self::Handle) -> io::Result<()> {
            drop(handle);
            Ok(())
        }

        fn read_at(&self, handle: &Self::Handle, buf: &mut [u8], page_offset: u64) -> io::Result<usize> {
            use std::os::unix::fs::FileExt;
            let n = handle.read_at(buf, page_offset)?;
            Ok(n)
        }

        fn write_at(&self, handle: &Self::Handle, buf: &[u8], page_offset: u64) -> io::Result<usize> {
            use std::os::unix::fs::FileExt;
            let n = handle.write_at(buf, page_offset)?;
            Ok(n)
        }

        fn zero_fill(&self, handle: &Self::Handle, page_size: u64) -> io::Result<()> {
            use std::os::unix::fs::FileExt;
            let zeros = vec![0u8; 64 * 1024];
            let mut written = 0u64;
            while written < page_size {
                let chunk = (page_size - written).min(zeros.len() as u64) as usize;
                handle.write_at(&zeros[..chunk], written)?;
                written += chunk as u64;
            }
            Ok(())
        }

        fn remove(&self, page: PageId) -> io::Result<()> {
            let path = self.path_for(page);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            Ok(())
        }

        fn residual_pages(&self) -> io::Result<Vec<PageId>> {
            Ok(self.residual.clone())
        }

        fn path_for(&self, page: PageId) -> std::path::PathBuf {
            self.dir.path().join(format!("page{}", page.0))
        }
    }

}
