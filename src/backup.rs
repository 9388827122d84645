//! This module implements the backup-agent core: a chunk codec for a
//! deduplicating Merkle DAG, an embedded cache of file/directory identity
//! so unchanged content never gets re-read, a directory-change monitor, and
//! the upload engines that walk backup roots and push new chunks to the
//! object store.
//!
//! # Data model
//!
//! Every filesystem object is mapped onto one or more content-addressed
//! chunks (see [`codec`]). A directory's chunk lists its children by name
//! along with each child's own chunk sequence, so unchanged subtrees
//! naturally reuse their prior digests. The [`cache`] module persists the
//! `(device, inode, ctime, mtime) -> chunk sequence` mapping that makes
//! this cheap across runs.
//!
//! # Concurrency
//!
//! One [`upload::Upload`] engine walks a single backup root using a pool of
//! `tokio` tasks draining a depth-priority work queue; [`upload_set`]
//! coordinates one engine per configured root and composes their snapshots
//! into a single meta-root; [`cdp`] debounces directory-change
//! notifications from [`watch`] into partial-backup triggers.

mod fsobjid;
pub use fsobjid::*;

mod codec;
pub use codec::*;

mod cache;
pub use cache::*;

mod watch;
pub use watch::*;

mod upload;
pub use upload::*;

mod upload_set;
pub use upload_set::*;

mod cdp;
pub use cdp::*;
