//! Objects: data, attributes, and mutation ordering
//!
//! An object's mutable state lives on its home core and is only touched
//! there. Write-class operations enqueue a token on the object's FIFO
//! mutation queue before starting their page work and release it on
//! completion; a commit barrier resolves once every earlier token has been
//! released. Reads never enqueue: they snapshot the logical length once
//! and rely on copy-on-write pages for consistency.

use crate::collection::ObjectTable;
use crate::iovec::Iovec;
use crate::pageset::PageSet;
use crate::shard::ShardPool;
use bytes::Bytes;
use crimson_common::{
    object_core, AttrNamespace, Error, Range, Result, ATTR_NS_COUNT, MAX_ATTR_NAME_LEN,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tokio::sync::oneshot;

/// FIFO of in-flight write-class operations on one object
pub(crate) struct MutationQueue {
    entries: RefCell<VecDeque<MutationEntry>>,
    next_id: Cell<u64>,
}

struct MutationEntry {
    id: u64,
    barrier: Option<oneshot::Sender<()>>,
}

impl MutationQueue {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(VecDeque::new()),
            next_id: Cell::new(1),
        })
    }

    /// Attach a write token to the tail; released when the guard drops
    fn push(queue: &Rc<Self>) -> MutationGuard {
        let id = queue.next_id.get();
        queue.next_id.set(id + 1);
        queue.entries.borrow_mut().push_back(MutationEntry { id, barrier: None });
        MutationGuard {
            queue: queue.clone(),
            id,
        }
    }

    /// Enqueue a barrier; `None` means there is nothing to wait for
    fn push_barrier(&self) -> Option<oneshot::Receiver<()>> {
        let mut entries = self.entries.borrow_mut();
        if entries.is_empty() {
            return None;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let (tx, rx) = oneshot::channel();
        entries.push_back(MutationEntry {
            id,
            barrier: Some(tx),
        });
        Some(rx)
    }

    fn release(&self, id: u64) {
        let mut entries = self.entries.borrow_mut();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries.remove(pos);
        }
        // Every barrier that reached the head is now satisfied.
        while entries.front().is_some_and(|e| e.barrier.is_some()) {
            if let Some(entry) = entries.pop_front() {
                if let Some(tx) = entry.barrier {
                    let _ = tx.send(());
                }
            }
        }
    }
}

fn checked_end(range: Range) -> Result<u64> {
    range.checked_end().ok_or_else(|| {
        Error::invalid_argument(format!(
            "range offset {} + length {} overflows",
            range.offset, range.length
        ))
    })
}

struct MutationGuard {
    queue: Rc<MutationQueue>,
    id: u64,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}

/// Position of an outstanding attribute enumeration
///
/// Cursors pin no data. They are registered weakly on the object and
/// flipped invalid when the key they point at is removed.
pub(crate) struct AttrCursorState {
    ns: AttrNamespace,
    /// Next key the enumeration would return
    next: Option<String>,
    valid: Cell<bool>,
}

/// Worker-local object state, touched only on the object's home core
pub(crate) struct ObjectState {
    oid: String,
    table: Weak<ObjectTable>,
    data_len: Cell<u64>,
    pages: PageSet,
    attrs: RefCell<[BTreeMap<String, Bytes>; ATTR_NS_COUNT]>,
    header: RefCell<Option<Bytes>>,
    mutations: Rc<MutationQueue>,
    cursors: RefCell<Vec<Weak<AttrCursorState>>>,
}

impl ObjectState {
    pub fn new(oid: String, table: Weak<ObjectTable>, pages: PageSet) -> Rc<Self> {
        Rc::new(Self {
            oid,
            table,
            data_len: Cell::new(0),
            pages,
            attrs: RefCell::new(Default::default()),
            header: RefCell::new(None),
            mutations: MutationQueue::new(),
            cursors: RefCell::new(Vec::new()),
        })
    }

    pub fn data_len(&self) -> u64 {
        self.data_len.get()
    }

    pub async fn read(&self, range: Range) -> Result<Iovec> {
        if range.is_empty() {
            return Ok(Iovec::new());
        }
        // Snapshot the length once; concurrent writers cannot tear pages.
        let len = self.data_len.get();
        if checked_end(range)? > len {
            return Err(Error::OutOfRange {
                offset: range.offset,
                length: range.length,
                end: len,
            });
        }
        self.pages.read(range).await
    }

    pub async fn write(&self, iov: Iovec) -> Result<()> {
        let Some(end) = iov.end() else {
            return Ok(());
        };
        let _token = MutationQueue::push(&self.mutations);
        self.pages.write(Arc::new(iov)).await?;
        if end > self.data_len.get() {
            self.data_len.set(end);
        }
        Ok(())
    }

    /// Hole punch without the range check; extends the logical length
    pub async fn zero(&self, range: Range) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let end = checked_end(range)?;
        let _token = MutationQueue::push(&self.mutations);
        self.pages.hole_punch(range).await?;
        if end > self.data_len.get() {
            self.data_len.set(end);
        }
        Ok(())
    }

    pub async fn hole_punch(&self, range: Range) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let len = self.data_len.get();
        if checked_end(range)? > len {
            return Err(Error::OutOfRange {
                offset: range.offset,
                length: range.length,
                end: len,
            });
        }
        let _token = MutationQueue::push(&self.mutations);
        self.pages.hole_punch(range).await
    }

    /// Truncate only shrinks; an extending length is rejected
    pub async fn truncate(&self, length: u64) -> Result<()> {
        let len = self.data_len.get();
        if length > len {
            return Err(Error::invalid_argument(format!(
                "truncate to {length} would extend object of length {len}"
            )));
        }
        let _token = MutationQueue::push(&self.mutations);
        self.pages.free_pages_after(length).await?;
        self.data_len.set(length);
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        match self.mutations.push_barrier() {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| Error::InvalidHandle),
        }
    }

    pub async fn remove(&self) -> Result<()> {
        if let Some(table) = self.table.upgrade() {
            table.entries.borrow_mut().remove(&self.oid);
        }
        // Every attribute goes away with the object.
        self.for_each_cursor(|cursor| cursor.valid.set(false));
        self.pages.destroy().await
    }

    pub async fn page_counts(&self) -> Result<Vec<usize>> {
        self.pages.page_counts().await
    }

    // Attributes

    pub fn getattr(&self, ns: AttrNamespace, key: &str) -> Result<Bytes> {
        self.attrs.borrow()[ns.index()]
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NoSuchAttributeKey(key.to_string()))
    }

    pub fn getattrs(&self, ns: AttrNamespace, keys: &[String]) -> Result<Vec<Bytes>> {
        let attrs = self.attrs.borrow();
        keys.iter()
            .map(|key| {
                attrs[ns.index()]
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::NoSuchAttributeKey(key.clone()))
            })
            .collect()
    }

    pub fn setattr(&self, ns: AttrNamespace, key: String, value: Bytes) -> Result<()> {
        if key.len() > MAX_ATTR_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "attribute key exceeds {MAX_ATTR_NAME_LEN} bytes"
            )));
        }
        // Replacement rebinds the entry; an outstanding reader keeps the
        // buffer it already holds.
        self.attrs.borrow_mut()[ns.index()].insert(key, value);
        Ok(())
    }

    pub fn setattrs(&self, ns: AttrNamespace, pairs: Vec<(String, Bytes)>) -> Result<()> {
        for (key, _) in &pairs {
            if key.len() > MAX_ATTR_NAME_LEN {
                return Err(Error::invalid_argument(format!(
                    "attribute key exceeds {MAX_ATTR_NAME_LEN} bytes"
                )));
            }
        }
        let mut attrs = self.attrs.borrow_mut();
        for (key, value) in pairs {
            attrs[ns.index()].insert(key, value);
        }
        Ok(())
    }

    pub fn rmattr(&self, ns: AttrNamespace, key: &str) -> Result<()> {
        if self.attrs.borrow_mut()[ns.index()].remove(key).is_none() {
            return Err(Error::NoSuchAttributeKey(key.to_string()));
        }
        self.invalidate_cursors(ns, key);
        Ok(())
    }

    /// Atomic group removal: verify every key before removing any
    pub fn rmattrs(&self, ns: AttrNamespace, keys: &[String]) -> Result<()> {
        {
            let attrs = self.attrs.borrow();
            for key in keys {
                if !attrs[ns.index()].contains_key(key) {
                    return Err(Error::NoSuchAttributeKey(key.clone()));
                }
            }
        }
        let mut attrs = self.attrs.borrow_mut();
        for key in keys {
            attrs[ns.index()].remove(key);
        }
        drop(attrs);
        for key in keys {
            self.invalidate_cursors(ns, key);
        }
        Ok(())
    }

    /// Enumerate up to `to_return` keys, resuming from `cursor`
    ///
    /// Returns the keys and, when more remain, the position of the next
    /// enumeration.
    pub fn enumerate_attr_keys(
        &self,
        ns: AttrNamespace,
        cursor: Option<&Rc<AttrCursorState>>,
        to_return: usize,
    ) -> Result<(Vec<String>, Option<Rc<AttrCursorState>>)> {
        let (keys, next) = self.enumerate(ns, cursor, to_return, |key, _| key.clone())?;
        Ok((keys, next))
    }

    pub fn enumerate_attr_kvs(
        &self,
        ns: AttrNamespace,
        cursor: Option<&Rc<AttrCursorState>>,
        to_return: usize,
    ) -> Result<(Vec<(String, Bytes)>, Option<Rc<AttrCursorState>>)> {
        self.enumerate(ns, cursor, to_return, |key, value| {
            (key.clone(), value.clone())
        })
    }

    fn enumerate<T>(
        &self,
        ns: AttrNamespace,
        cursor: Option<&Rc<AttrCursorState>>,
        to_return: usize,
        mut item: impl FnMut(&String, &Bytes) -> T,
    ) -> Result<(Vec<T>, Option<Rc<AttrCursorState>>)> {
        let start = match cursor {
            Some(cursor) => {
                if !cursor.valid.get() {
                    return Err(Error::InvalidCursor);
                }
                if cursor.ns != ns {
                    return Err(Error::invalid_argument(format!(
                        "cursor belongs to namespace {}",
                        cursor.ns
                    )));
                }
                match cursor.next.clone() {
                    Some(key) => Bound::Included(key),
                    None => return Ok((Vec::new(), None)),
                }
            }
            None => Bound::Unbounded,
        };

        let attrs = self.attrs.borrow();
        let map = &attrs[ns.index()];
        let mut items = Vec::with_capacity(to_return.min(map.len()));
        let mut rest = map.range((start, Bound::Unbounded));
        for (key, value) in rest.by_ref().take(to_return) {
            items.push(item(key, value));
        }

        let next = rest.next().map(|(key, _)| {
            let cursor = Rc::new(AttrCursorState {
                ns,
                next: Some(key.clone()),
                valid: Cell::new(true),
            });
            self.cursors.borrow_mut().push(Rc::downgrade(&cursor));
            cursor
        });
        Ok((items, next))
    }

    fn invalidate_cursors(&self, ns: AttrNamespace, removed: &str) {
        self.for_each_cursor(|cursor| {
            if cursor.ns == ns && cursor.next.as_deref() == Some(removed) {
                cursor.valid.set(false);
            }
        });
    }

    /// Walk the outstanding cursors, dropping entries whose handle is gone
    fn for_each_cursor(&self, mut f: impl FnMut(&AttrCursorState)) {
        self.cursors.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(cursor) => {
                f(&cursor);
                true
            }
            None => false,
        });
    }

    // Omap header

    pub fn get_header(&self) -> Bytes {
        self.header.borrow().clone().unwrap_or_else(Bytes::new)
    }

    pub fn set_header(&self, header: Bytes) {
        *self.header.borrow_mut() = Some(header);
    }
}

/// Handle to an object, usable from any thread
///
/// Operations are submitted to the object's home core. Dropping the handle
/// releases its reference; the object itself persists until removed from
/// its collection.
pub struct Object {
    pool: Arc<ShardPool>,
    core: usize,
    id: u64,
    oid: String,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("core", &self.core)
            .field("id", &self.id)
            .field("oid", &self.oid)
            .finish()
    }
}

impl Object {
    pub(crate) fn new(pool: Arc<ShardPool>, core: usize, id: u64, oid: String) -> Self {
        Self { pool, core, id, oid }
    }

    #[must_use]
    pub fn oid(&self) -> &str {
        &self.oid
    }

    /// Home core of this object; a pure function of the oid
    #[must_use]
    pub fn home_core(&self) -> usize {
        debug_assert_eq!(self.core, object_core(&self.oid, self.pool.cores()));
        self.core
    }

    /// Read a byte range; offsets absent from the result are holes
    pub async fn read(&self, range: Range) -> Result<Iovec> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.read(range).await
            })
            .await
    }

    pub async fn write(&self, iov: Iovec) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.write(iov).await
            })
            .await
    }

    /// Write one buffer at an offset
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        self.write(Iovec::single(offset, data)).await
    }

    pub async fn zero(&self, range: Range) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.zero(range).await
            })
            .await
    }

    pub async fn hole_punch(&self, range: Range) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.hole_punch(range).await
            })
            .await
    }

    pub async fn truncate(&self, length: u64) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.truncate(length).await
            })
            .await
    }

    /// Barrier: resolves once every earlier write-class operation on this
    /// object has completed
    pub async fn commit(&self) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.commit().await
            })
            .await
    }

    /// Remove the object from its collection and release its pages
    pub async fn remove(self) -> Result<()> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.remove().await
            })
            .await
    }

    pub async fn data_len(&self) -> Result<u64> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| Ok(ctx.object(id)?.data_len()))
            .await
    }

    /// Resident page count per core slice
    pub async fn page_counts(&self) -> Result<Vec<usize>> {
        let id = self.id;
        self.pool
            .submit_async(self.core, move |ctx| async move {
                ctx.object(id)?.page_counts().await
            })
            .await
    }

    pub async fn getattr(&self, ns: AttrNamespace, key: &str) -> Result<Bytes> {
        let id = self.id;
        let key = key.to_string();
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.getattr(ns, &key))
            .await
    }

    pub async fn getattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<Vec<Bytes>> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.getattrs(ns, &keys))
            .await
    }

    pub async fn setattr(&self, ns: AttrNamespace, key: &str, value: Bytes) -> Result<()> {
        let id = self.id;
        let key = key.to_string();
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.setattr(ns, key, value))
            .await
    }

    pub async fn setattrs(&self, ns: AttrNamespace, pairs: Vec<(String, Bytes)>) -> Result<()> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.setattrs(ns, pairs))
            .await
    }

    pub async fn rmattr(&self, ns: AttrNamespace, key: &str) -> Result<()> {
        let id = self.id;
        let key = key.to_string();
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.rmattr(ns, &key))
            .await
    }

    pub async fn rmattrs(&self, ns: AttrNamespace, keys: Vec<String>) -> Result<()> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| ctx.object(id)?.rmattrs(ns, &keys))
            .await
    }

    pub async fn enumerate_attr_keys(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        to_return: usize,
    ) -> Result<(Vec<String>, Option<AttrCursor>)> {
        let id = self.id;
        let cursor_id = cursor.as_ref().map(|c| c.id);
        let (keys, next) = self
            .pool
            .submit(self.core, move |ctx| {
                let object = ctx.object(id)?;
                let state = match cursor_id {
                    Some(cid) => Some(ctx.cursor(cid)?),
                    None => None,
                };
                let (keys, next) = object.enumerate_attr_keys(ns, state.as_ref(), to_return)?;
                Ok((keys, next.map(|c| register_cursor(ctx, c))))
            })
            .await?;
        Ok((keys, next.map(|nid| self.wrap_cursor(nid))))
    }

    pub async fn enumerate_attr_kvs(
        &self,
        ns: AttrNamespace,
        cursor: Option<AttrCursor>,
        to_return: usize,
    ) -> Result<(Vec<(String, Bytes)>, Option<AttrCursor>)> {
        let id = self.id;
        let cursor_id = cursor.as_ref().map(|c| c.id);
        let (kvs, next) = self
            .pool
            .submit(self.core, move |ctx| {
                let object = ctx.object(id)?;
                let state = match cursor_id {
                    Some(cid) => Some(ctx.cursor(cid)?),
                    None => None,
                };
                let (kvs, next) = object.enumerate_attr_kvs(ns, state.as_ref(), to_return)?;
                Ok((kvs, next.map(|c| register_cursor(ctx, c))))
            })
            .await?;
        Ok((kvs, next.map(|nid| self.wrap_cursor(nid))))
    }

    pub async fn get_header(&self) -> Result<Bytes> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| Ok(ctx.object(id)?.get_header()))
            .await
    }

    pub async fn set_header(&self, header: Bytes) -> Result<()> {
        let id = self.id;
        self.pool
            .submit(self.core, move |ctx| {
                ctx.object(id)?.set_header(header);
                Ok(())
            })
            .await
    }

    /// Allocation hints are accepted and ignored by this backend
    pub async fn set_alloc_hint(&self, _obj_size: u64, _write_size: u64) -> Result<()> {
        Ok(())
    }

    // Operations this backend does not implement

    pub async fn clone_object(&self, _dest: &Object) -> Result<()> {
        Err(Error::not_supported("clone"))
    }

    pub async fn clone_range(&self, _src: Range, _dest: &Object, _dest_offset: u64) -> Result<()> {
        Err(Error::not_supported("clone_range"))
    }

    pub async fn rmattr_range(
        &self,
        _ns: AttrNamespace,
        _lb: &AttrCursor,
        _ub: &AttrCursor,
    ) -> Result<()> {
        Err(Error::not_supported("rmattr_range"))
    }

    pub async fn attr_cursor(&self, _ns: AttrNamespace, _key: &str) -> Result<AttrCursor> {
        Err(Error::not_supported("attr_cursor"))
    }

    pub async fn get_extents(&self, _range: Range) -> Result<Vec<Range>> {
        Err(Error::not_supported("get_extents"))
    }

    pub async fn move_to_collection(&self, _dest_cid: &str, _dest_oid: &str) -> Result<()> {
        Err(Error::not_supported("move_to_collection"))
    }

    fn wrap_cursor(&self, id: u64) -> AttrCursor {
        AttrCursor {
            pool: self.pool.clone(),
            core: self.core,
            id,
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        let id = self.id;
        self.pool.post(self.core, move |ctx| {
            ctx.objects.borrow_mut().remove(&id);
        });
    }
}

fn register_cursor(ctx: &Rc<crate::shard::ShardCtx>, cursor: Rc<AttrCursorState>) -> u64 {
    let id = ctx.alloc_id();
    ctx.cursors.borrow_mut().insert(id, cursor);
    id
}

/// Opaque continuation handle for attribute enumeration
pub struct AttrCursor {
    pool: Arc<ShardPool>,
    core: usize,
    id: u64,
}

impl std::fmt::Debug for AttrCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrCursor")
            .field("core", &self.core)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for AttrCursor {
    fn drop(&mut self) {
        let id = self.id;
        self.pool.post(self.core, move |ctx| {
            ctx.cursors.borrow_mut().remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_waits_for_earlier_tokens() {
        let queue = MutationQueue::new();
        let token = MutationQueue::push(&queue);

        let mut rx = queue.push_barrier().expect("queue was not empty");
        assert!(rx.try_recv().is_err());

        drop(token);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_barrier_on_idle_queue_is_immediate() {
        let queue = MutationQueue::new();
        assert!(queue.push_barrier().is_none());
    }

    #[test]
    fn test_barrier_ignores_later_tokens() {
        let queue = MutationQueue::new();
        let first = MutationQueue::push(&queue);
        let mut rx = queue.push_barrier().expect("queue was not empty");
        let second = MutationQueue::push(&queue);

        drop(first);
        // The barrier only waited for tokens enqueued before it.
        assert!(rx.try_recv().is_ok());
        drop(second);
    }

    #[test]
    fn test_out_of_order_release() {
        let queue = MutationQueue::new();
        let first = MutationQueue::push(&queue);
        let second = MutationQueue::push(&queue);
        let mut rx = queue.push_barrier().expect("queue was not empty");

        // Completing the later write first does not satisfy the barrier.
        drop(second);
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_stacked_barriers_fire_together() {
        let queue = MutationQueue::new();
        let token = MutationQueue::push(&queue);
        let mut b1 = queue.push_barrier().expect("queue was not empty");
        let mut b2 = queue.push_barrier().expect("queue was not empty");

        drop(token);
        assert!(b1.try_recv().is_ok());
        assert!(b2.try_recv().is_ok());
    }
}
