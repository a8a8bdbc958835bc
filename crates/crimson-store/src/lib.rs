//! Crimson Store - sharded in-memory object store
//!
//! Objects live in named collections; both are pinned to home cores by
//! hashing their ids, and object data is striped over every core in
//! 16-page stripes of 64 KiB copy-on-write pages. Cross-core work is
//! message passing between per-core single-threaded workers; there are no
//! locks on the data path.

mod collection;
mod iovec;
mod object;
mod page;
mod pageset;
mod shard;
mod store;

pub use collection::Collection;
pub use iovec::Iovec;
pub use object::{AttrCursor, Object};
pub use store::Store;

pub use crimson_common::{AttrNamespace, Range};
