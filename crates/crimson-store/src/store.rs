//! Store: process-wide root of the sharded object store
//!
//! The store routes collection ids to their home cores and owns the
//! worker pool. Collections whose cid hashes to a core live in that
//! core's table; every operation hops to the home core before touching
//! local state.

use crate::collection::{Collection, CollectionState, ObjectTable, TableHandle};
use crate::shard::ShardPool;
use crimson_common::{collection_core, Error, Result, MAX_ATTR_NAME_LEN, MAX_OBJECT_NAME_LEN};
use futures::future::try_join_all;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The sharded in-memory object store
pub struct Store {
    pool: Arc<ShardPool>,
    fsid: Uuid,
}

impl Store {
    /// Spin up `workers` cores and an empty store
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ShardPool::new(workers)?;
        let fsid = Uuid::new_v4();
        debug!(%fsid, cores = pool.cores(), "store created");
        Ok(Self { pool, fsid })
    }

    #[must_use]
    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    #[must_use]
    pub fn cores(&self) -> usize {
        self.pool.cores()
    }

    #[must_use]
    pub const fn max_object_name_length() -> usize {
        MAX_OBJECT_NAME_LEN
    }

    #[must_use]
    pub const fn max_attr_name_length() -> usize {
        MAX_ATTR_NAME_LEN
    }

    /// Create a collection; fails if the cid is already present
    pub async fn create_collection(&self, cid: &str) -> Result<Collection> {
        if cid.is_empty() || cid.len() > MAX_OBJECT_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "collection name must be 1..={MAX_OBJECT_NAME_LEN} bytes"
            )));
        }
        let cores = self.pool.cores();
        let home = collection_core(cid, cores);

        // Build the per-core object tables first, then publish the
        // collection on its home core in one step so a concurrent create
        // of the same cid cannot slip in between.
        let futs = (0..cores).map(|core| {
            self.pool.submit(core, move |ctx| {
                let id = ctx.alloc_id();
                ctx.tables
                    .borrow_mut()
                    .insert(id, Rc::new(ObjectTable::default()));
                Ok(TableHandle { core, id })
            })
        });
        let tables = try_join_all(futs).await?;

        let cid_owned = cid.to_string();
        let publish = {
            let tables = tables.clone();
            self.pool
                .submit(home, move |ctx| {
                    if ctx.collections.borrow().contains_key(&cid_owned) {
                        return Err(Error::CollectionExists(cid_owned));
                    }
                    let state = Rc::new(CollectionState { tables });
                    ctx.collections
                        .borrow_mut()
                        .insert(cid_owned, state.clone());
                    let id = ctx.alloc_id();
                    ctx.collection_handles.borrow_mut().insert(id, state);
                    Ok(id)
                })
                .await
        };

        match publish {
            Ok(id) => Ok(Collection::new(
                self.pool.clone(),
                home,
                id,
                cid.to_string(),
                Arc::new(tables),
            )),
            Err(err) => {
                // Unpublish the tables we provisioned.
                for table in tables {
                    self.pool.post(table.core, move |ctx| {
                        ctx.tables.borrow_mut().remove(&table.id);
                    });
                }
                Err(err)
            }
        }
    }

    /// Open an existing collection
    pub async fn lookup_collection(&self, cid: &str) -> Result<Collection> {
        let home = collection_core(cid, self.pool.cores());
        let cid_owned = cid.to_string();
        let (id, tables) = self
            .pool
            .submit(home, move |ctx| {
                let state = ctx
                    .collections
                    .borrow()
                    .get(&cid_owned)
                    .cloned()
                    .ok_or(Error::NoSuchCollection(cid_owned))?;
                let id = ctx.alloc_id();
                let tables = state.tables.clone();
                ctx.collection_handles.borrow_mut().insert(id, state);
                Ok((id, tables))
            })
            .await?;
        Ok(Collection::new(
            self.pool.clone(),
            home,
            id,
            cid.to_string(),
            Arc::new(tables),
        ))
    }

    pub async fn collection_exists(&self, cid: &str) -> Result<bool> {
        let home = collection_core(cid, self.pool.cores());
        let cid_owned = cid.to_string();
        self.pool
            .submit(home, move |ctx| {
                Ok(ctx.collections.borrow().contains_key(&cid_owned))
            })
            .await
    }

    /// Remove a collection; fails unless it is empty on every core
    pub async fn remove_collection(&self, cid: &str) -> Result<()> {
        self.lookup_collection(cid).await?.remove().await
    }

    /// Wipe all state on every core
    ///
    /// Outstanding handles fail with `invalid_handle` afterwards.
    pub async fn mkfs(&self) -> Result<()> {
        let futs = (0..self.pool.cores()).map(|core| {
            self.pool.submit(core, |ctx| {
                ctx.wipe();
                Ok(())
            })
        });
        try_join_all(futs).await?;
        Ok(())
    }
}
