//! Core type definitions for Crimson
//!
//! This module defines the byte-range and attribute-namespace types used by
//! the store, the page/stripe geometry constants, and the routing functions
//! that pin collections and objects to their home cores.

use crate::error::{Error, Result};
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Fixed page size of the in-memory store
pub const PAGE_SIZE: usize = 64 * 1024;

/// Number of consecutive pages per stripe
pub const PAGES_PER_STRIPE: u64 = 16;

/// Bytes covered by one stripe
pub const STRIPE_BYTES: u64 = PAGE_SIZE as u64 * PAGES_PER_STRIPE;

/// Maximum object name length in bytes
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

/// Maximum attribute key length in bytes
pub const MAX_ATTR_NAME_LEN: usize = 256;

// Independent seeds keep collection and object routing uncorrelated.
const CID_SEED: u64 = 0xbf58_476d_1ce4_e5b9;
const OID_SEED: u64 = 0x94d0_49bb_1331_11eb;

/// Home core for a collection id
#[must_use]
pub fn collection_core(cid: &str, cores: usize) -> usize {
    (xxh64(cid.as_bytes(), CID_SEED) % cores as u64) as usize
}

/// Home core for an object id
#[must_use]
pub fn object_core(oid: &str, cores: usize) -> usize {
    (xxh64(oid.as_bytes(), OID_SEED) % cores as u64) as usize
}

/// Index of the page containing a byte offset
#[must_use]
pub fn page_index(offset: u64) -> u64 {
    offset / PAGE_SIZE as u64
}

/// Slice (= core) owning the stripe that contains a byte offset
#[must_use]
pub fn slice_of_offset(offset: u64, cores: usize) -> usize {
    ((offset / STRIPE_BYTES) % cores as u64) as usize
}

/// A byte range within an object
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Exclusive end offset, `None` when the range overflows
    #[must_use]
    pub const fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Attribute namespace of an object
///
/// `Xattr` and `Omap` are disjoint key/value scopes with identical
/// semantics in this store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttrNamespace {
    Xattr = 0,
    Omap = 1,
}

/// Number of attribute namespaces
pub const ATTR_NS_COUNT: usize = 2;

impl AttrNamespace {
    /// Array index of this namespace
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode a namespace from its wire index
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(Self::Xattr),
            1 => Ok(Self::Omap),
            n => Err(Error::invalid_argument(format!(
                "attribute namespace {n} out of range"
            ))),
        }
    }
}

impl fmt::Display for AttrNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xattr => write!(f, "xattr"),
            Self::Omap => write!(f, "omap"),
        }
    }
}
