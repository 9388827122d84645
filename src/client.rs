//! HTTP client(s) this crate uses to talk to external services. Currently
//! just the content-addressed object store the upload engine pushes chunks
//! and snapshot records to.

mod object_store;
pub use object_store::*;
