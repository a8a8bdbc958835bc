//! Per-core shard runtime
//!
//! A fixed pool of worker threads, one per configured core, each driving a
//! single-threaded tokio runtime. Cross-core work is effected by submitting
//! closures to the target core's task queue; results travel back on oneshot
//! channels. Worker-local state is reached only through these submissions,
//! so the per-core registries need no locks.
//!
//! Foreign handles name worker-local state as `(home core, id)` pairs
//! resolved against the registries below. An id that no longer resolves
//! (the entry was removed, or the store was wiped) surfaces as
//! `Error::InvalidHandle`.

use crate::collection::{CollectionState, ObjectTable};
use crate::object::{AttrCursorState, ObjectState};
use crate::pageset::PageSlice;
use crimson_common::{Error, Result};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

type ShardTask = Box<dyn FnOnce(&Rc<ShardCtx>) + Send + 'static>;

/// Registries owned by one worker thread
pub(crate) struct ShardCtx {
    pub core: usize,
    pub cores: usize,
    pool: RefCell<Weak<ShardPool>>,
    next_id: Cell<u64>,
    /// Collections homed on this core, by cid
    pub collections: RefCell<HashMap<String, Rc<CollectionState>>>,
    /// Open collection handle slots
    pub collection_handles: RefCell<HashMap<u64, Rc<CollectionState>>>,
    /// Per-collection object tables for this core
    pub tables: RefCell<HashMap<u64, Rc<ObjectTable>>>,
    /// Open object handle slots
    pub objects: RefCell<HashMap<u64, Rc<ObjectState>>>,
    /// Page slices for objects striped over this core
    pub slices: RefCell<HashMap<u64, Rc<RefCell<PageSlice>>>>,
    /// Outstanding attribute cursor slots
    pub cursors: RefCell<HashMap<u64, Rc<AttrCursorState>>>,
}

impl ShardCtx {
    fn new(core: usize, cores: usize) -> Self {
        Self {
            core,
            cores,
            pool: RefCell::new(Weak::new()),
            next_id: Cell::new(1),
            collections: RefCell::new(HashMap::new()),
            collection_handles: RefCell::new(HashMap::new()),
            tables: RefCell::new(HashMap::new()),
            objects: RefCell::new(HashMap::new()),
            slices: RefCell::new(HashMap::new()),
            cursors: RefCell::new(HashMap::new()),
        }
    }

    /// Allocate a registry id; ids are never reused
    pub fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// The pool this context belongs to, for fan-out from within a worker
    pub fn pool(&self) -> Result<Arc<ShardPool>> {
        self.pool.borrow().upgrade().ok_or(Error::InvalidHandle)
    }

    pub fn object(&self, id: u64) -> Result<Rc<ObjectState>> {
        self.objects.borrow().get(&id).cloned().ok_or(Error::InvalidHandle)
    }

    pub fn collection_handle(&self, id: u64) -> Result<Rc<CollectionState>> {
        self.collection_handles
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    pub fn table(&self, id: u64) -> Result<Rc<ObjectTable>> {
        self.tables.borrow().get(&id).cloned().ok_or(Error::InvalidHandle)
    }

    pub fn slice(&self, id: u64) -> Result<Rc<RefCell<PageSlice>>> {
        self.slices.borrow().get(&id).cloned().ok_or(Error::InvalidHandle)
    }

    pub fn cursor(&self, id: u64) -> Result<Rc<AttrCursorState>> {
        self.cursors.borrow().get(&id).cloned().ok_or(Error::InvalidHandle)
    }

    /// Drop every registry entry on this core
    pub fn wipe(&self) {
        self.collections.borrow_mut().clear();
        self.collection_handles.borrow_mut().clear();
        self.tables.borrow_mut().clear();
        self.objects.borrow_mut().clear();
        self.slices.borrow_mut().clear();
        self.cursors.borrow_mut().clear();
    }
}

/// Fixed pool of per-core workers
pub(crate) struct ShardPool {
    senders: Vec<mpsc::UnboundedSender<ShardTask>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool").finish()
    }
}

impl ShardPool {
    /// Spawn `cores` workers and wire each context back to the pool
    pub fn new(cores: usize) -> Result<Arc<Self>> {
        let cores = cores.max(1);
        let mut senders = Vec::with_capacity(cores);
        let mut receivers = Vec::with_capacity(cores);
        for _ in 0..cores {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let pool = Arc::new(Self {
            senders,
            workers: Mutex::new(Vec::with_capacity(cores)),
        });

        for (core, rx) in receivers.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("crimson-shard-{core}"))
                .spawn(move || worker_main(core, cores, rx))?;
            pool.workers.lock().push(handle);
        }

        // First task on every core: link the context to the pool so workers
        // can fan out to their peers.
        for core in 0..cores {
            let weak = Arc::downgrade(&pool);
            pool.post(core, move |ctx| {
                *ctx.pool.borrow_mut() = weak;
            });
        }

        Ok(pool)
    }

    pub fn cores(&self) -> usize {
        self.senders.len()
    }

    /// Run a closure on the target core and await its result
    pub async fn submit<F, R>(&self, core: usize, f: F) -> Result<R>
    where
        F: FnOnce(&Rc<ShardCtx>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: ShardTask = Box::new(move |ctx| {
            let _ = tx.send(f(ctx));
        });
        self.senders[core]
            .send(task)
            .map_err(|_| Error::InvalidHandle)?;
        rx.await.map_err(|_| Error::InvalidHandle)?
    }

    /// Run an async closure on the target core's local executor
    pub async fn submit_async<F, Fut, R>(&self, core: usize, f: F) -> Result<R>
    where
        F: FnOnce(Rc<ShardCtx>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: ShardTask = Box::new(move |ctx| {
            let ctx = ctx.clone();
            tokio::task::spawn_local(async move {
                let _ = tx.send(f(ctx).await);
            });
        });
        self.senders[core]
            .send(task)
            .map_err(|_| Error::InvalidHandle)?;
        rx.await.map_err(|_| Error::InvalidHandle)?
    }

    /// Fire-and-forget a closure at the target core (used by handle drops)
    pub fn post<F>(&self, core: usize, f: F)
    where
        F: FnOnce(&Rc<ShardCtx>) + Send + 'static,
    {
        let _ = self.senders[core].send(Box::new(f));
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.senders.clear();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn worker_main(core: usize, cores: usize, mut rx: mpsc::UnboundedReceiver<ShardTask>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(core, %err, "failed to start shard worker runtime");
            return;
        }
    };

    let ctx = Rc::new(ShardCtx::new(core, cores));
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        while let Some(task) = rx.recv().await {
            task(&ctx);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_runs_on_target_core() {
        let pool = ShardPool::new(4).unwrap();
        for core in 0..4 {
            let seen = pool.submit(core, |ctx| Ok(ctx.core)).await.unwrap();
            assert_eq!(seen, core);
        }
    }

    #[tokio::test]
    async fn test_submit_async_can_fan_out() {
        let pool = ShardPool::new(3).unwrap();
        // A task on core 0 asks every peer for its core id.
        let sum = pool
            .submit_async(0, |ctx| async move {
                let pool = ctx.pool()?;
                let mut sum = 0;
                for core in 0..ctx.cores {
                    sum += pool.submit(core, |ctx| Ok(ctx.core)).await?;
                }
                Ok(sum)
            })
            .await
            .unwrap();
        assert_eq!(sum, 0 + 1 + 2);
    }

    #[tokio::test]
    async fn test_registry_ids_resolve_until_removed() {
        let pool = ShardPool::new(2).unwrap();
        let id = pool
            .submit(1, |ctx| {
                let id = ctx.alloc_id();
                ctx.slices.borrow_mut().insert(
                    id,
                    Rc::new(RefCell::new(PageSlice::new(1, 2))),
                );
                Ok(id)
            })
            .await
            .unwrap();

        let found = pool
            .submit(1, move |ctx| Ok(ctx.slice(id).is_ok()))
            .await
            .unwrap();
        assert!(found);

        pool.submit(1, move |ctx| {
            ctx.slices.borrow_mut().remove(&id);
            Ok(())
        })
        .await
        .unwrap();

        let err = pool
            .submit(1, move |ctx| ctx.slice(id).map(|_| ()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHandle));
    }
}
