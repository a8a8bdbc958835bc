//! Copy-on-write pages
//!
//! Pages are the fixed-size unit of object data. A page is shared between
//! readers and its owning slice by refcount; a writer obtains exclusivity
//! by copying whenever the refcount exceeds one, so a read that captured a
//! page keeps observing the bytes it captured.

use bytes::Bytes;
use crimson_common::PAGE_SIZE;
use std::sync::Arc;

/// One 64 KiB page of object data
#[derive(Clone)]
pub(crate) struct Page {
    data: [u8; PAGE_SIZE],
}

/// Shared-ownership handle to a page
pub(crate) type PageRef = Arc<Page>;

impl Page {
    pub fn zeroed() -> PageRef {
        Arc::new(Page {
            data: [0; PAGE_SIZE],
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Writable view of a page, copying first if it is shared
pub(crate) fn writable(page: &mut PageRef) -> &mut [u8] {
    &mut Arc::make_mut(page).data
}

/// Zero-copy share of a page sub-range
///
/// The returned buffer owns a page reference, so the bytes stay valid for
/// as long as the buffer is held, regardless of later writes or removal.
pub(crate) fn share(page: &PageRef, offset: usize, len: usize) -> Bytes {
    Bytes::from_owner(PageSegment {
        page: page.clone(),
        offset,
        len,
    })
}

struct PageSegment {
    page: PageRef,
    offset: usize,
    len: usize,
}

impl AsRef<[u8]> for PageSegment {
    fn as_ref(&self) -> &[u8] {
        &self.page.data[self.offset..self.offset + self.len]
    }
}
