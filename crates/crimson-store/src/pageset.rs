//! Sparse striped page storage
//!
//! A `PageSet` shards one object's pages over every core: the stripe of
//! pages covering bytes `[k*W*P, (k+1)*W*P)` belongs to core `k mod C`.
//! Each core's `PageSlice` holds exactly the pages whose stripe falls to
//! it, so the hot page maps are only ever touched by their own worker
//! thread. Missing pages are holes and read as zeros.

use crate::iovec::Iovec;
use crate::page::{self, Page, PageRef};
use crate::shard::ShardPool;
use crimson_common::{page_index, Error, Range, Result, PAGE_SIZE};
use futures::future::try_join_all;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// One core's shard of an object's pages, keyed by page index
pub(crate) struct PageSlice {
    slice: usize,
    cores: usize,
    pages: BTreeMap<u64, PageRef>,
}

impl PageSlice {
    pub fn new(slice: usize, cores: usize) -> Self {
        Self {
            slice,
            cores,
            pages: BTreeMap::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Copy the sub-ranges of `iov` that land on this slice's stripes
    pub fn write(&mut self, iov: &Iovec) {
        for (mut offset, mut chunk) in iov.stripes(self.cores, self.slice) {
            while !chunk.is_empty() {
                let index = page_index(offset);
                let rel = (offset % PAGE_SIZE as u64) as usize;
                let n = (PAGE_SIZE - rel).min(chunk.len());
                let page = self.pages.entry(index).or_insert_with(Page::zeroed);
                page::writable(page)[rel..rel + n].copy_from_slice(&chunk[..n]);
                offset += n as u64;
                chunk = &chunk[n..];
            }
        }
    }

    /// Collect zero-copy shares of the resident pages intersecting `range`
    ///
    /// Boundary pages are emitted as partial shares; absent pages are
    /// holes and contribute nothing.
    pub fn read(&self, range: Range) -> Iovec {
        let mut iov = Iovec::new();
        if range.is_empty() || self.pages.is_empty() {
            return iov;
        }
        let first = page_index(range.offset);
        let last = page_index(range.end() - 1);
        for (&index, page) in self.pages.range(first..=last) {
            let page_start = index * PAGE_SIZE as u64;
            let begin = range.offset.max(page_start);
            let end = range.end().min(page_start + PAGE_SIZE as u64);
            iov.insert(
                begin,
                page::share(page, (begin - page_start) as usize, (end - begin) as usize),
            );
        }
        iov
    }

    /// Drop pages fully inside `range`, then zero the covered sub-ranges
    /// of the partially covered boundary pages
    ///
    /// The erase runs before the boundary zeroing so a concurrent partial
    /// read observes either the old bytes or zeros, never a torn page.
    pub fn hole_punch(&mut self, range: Range) {
        if range.is_empty() || self.pages.is_empty() {
            return;
        }
        let p = PAGE_SIZE as u64;
        let head = range.offset / p;
        let tail = (range.end() - 1) / p;

        let first_full = if range.offset % p == 0 { head } else { head + 1 };
        let last_full_excl = if range.end() % p == 0 { tail + 1 } else { tail };
        if first_full < last_full_excl {
            let doomed: Vec<u64> = self
                .pages
                .range(first_full..last_full_excl)
                .map(|(&k, _)| k)
                .collect();
            for index in doomed {
                self.pages.remove(&index);
            }
        }

        let mut zero_covered = |index: u64| {
            let page_start = index * p;
            let begin = range.offset.max(page_start);
            let end = range.end().min(page_start + p);
            if begin == page_start && end == page_start + p {
                return; // fully covered, erased above
            }
            if let Some(page) = self.pages.get_mut(&index) {
                page::writable(page)[(begin - page_start) as usize..(end - page_start) as usize]
                    .fill(0);
            }
        };
        zero_covered(head);
        if tail != head {
            zero_covered(tail);
        }
    }

    /// Release pages at or beyond `offset`; the boundary page keeps its
    /// prefix and has its tail zeroed so a later extension reads zeros
    pub fn free_pages_after(&mut self, offset: u64) {
        let p = PAGE_SIZE as u64;
        let first = offset.div_ceil(p);
        let doomed: Vec<u64> = self.pages.range(first..).map(|(&k, _)| k).collect();
        for index in doomed {
            self.pages.remove(&index);
        }
        if offset % p != 0 {
            if let Some(page) = self.pages.get_mut(&(offset / p)) {
                page::writable(page)[(offset % p) as usize..].fill(0);
            }
        }
    }
}

/// Handle to one registered slice: its home core and registry id
#[derive(Clone, Copy, Debug)]
pub(crate) struct SliceHandle {
    core: usize,
    id: u64,
}

/// Per-object page storage distributed across all cores
pub(crate) struct PageSet {
    pool: Weak<ShardPool>,
    slices: Vec<SliceHandle>,
}

impl PageSet {
    /// Register one empty slice on every core
    pub async fn create(pool: &Arc<ShardPool>) -> Result<Self> {
        let cores = pool.cores();
        let futs = (0..cores).map(|core| {
            pool.submit(core, move |ctx| {
                let id = ctx.alloc_id();
                ctx.slices
                    .borrow_mut()
                    .insert(id, Rc::new(RefCell::new(PageSlice::new(core, ctx.cores))));
                Ok(SliceHandle { core, id })
            })
        });
        let slices = try_join_all(futs).await?;
        Ok(Self {
            pool: Arc::downgrade(pool),
            slices,
        })
    }

    fn pool(&self) -> Result<Arc<ShardPool>> {
        self.pool.upgrade().ok_or(Error::InvalidHandle)
    }

    /// Fan the write out to every slice in parallel
    pub async fn write(&self, iov: Arc<Iovec>) -> Result<()> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            let iov = iov.clone();
            pool.submit(handle.core, move |ctx| {
                ctx.slice(handle.id)?.borrow_mut().write(&iov);
                Ok(())
            })
        });
        try_join_all(futs).await?;
        Ok(())
    }

    /// Gather per-slice reads and merge them into one ordered iovec
    pub async fn read(&self, range: Range) -> Result<Iovec> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            pool.submit(handle.core, move |ctx| {
                Ok(ctx.slice(handle.id)?.borrow().read(range))
            })
        });
        let parts = try_join_all(futs).await?;
        let mut merged = Iovec::new();
        for part in parts {
            merged.merge(part);
        }
        Ok(merged)
    }

    pub async fn hole_punch(&self, range: Range) -> Result<()> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            pool.submit(handle.core, move |ctx| {
                ctx.slice(handle.id)?.borrow_mut().hole_punch(range);
                Ok(())
            })
        });
        try_join_all(futs).await?;
        Ok(())
    }

    pub async fn free_pages_after(&self, offset: u64) -> Result<()> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            pool.submit(handle.core, move |ctx| {
                ctx.slice(handle.id)?.borrow_mut().free_pages_after(offset);
                Ok(())
            })
        });
        try_join_all(futs).await?;
        Ok(())
    }

    /// Resident page count per slice
    pub async fn page_counts(&self) -> Result<Vec<usize>> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            pool.submit(handle.core, move |ctx| {
                Ok(ctx.slice(handle.id)?.borrow().page_count())
            })
        });
        try_join_all(futs).await
    }

    /// Deregister every slice; outstanding read shares keep their pages
    pub async fn destroy(&self) -> Result<()> {
        let pool = self.pool()?;
        let futs = self.slices.iter().map(|&handle| {
            pool.submit(handle.core, move |ctx| {
                ctx.slices.borrow_mut().remove(&handle.id);
                Ok(())
            })
        });
        try_join_all(futs).await?;
        Ok(())
    }
}
