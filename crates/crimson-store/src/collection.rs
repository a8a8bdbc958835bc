//! Collections: named groupings of objects
//!
//! A collection is pinned to the home core of its cid. Its objects are
//! spread over every core: each core holds a table of the objects whose
//! oid routes there, so object creation and lookup touch exactly one
//! core's table.

use crate::object::{Object, ObjectState};
use crate::pageset::PageSet;
use crate::shard::ShardPool;
use crimson_common::{object_core, Error, Result, MAX_OBJECT_NAME_LEN};
use futures::future::try_join_all;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// One core's table of a collection's objects
#[derive(Default)]
pub(crate) struct ObjectTable {
    pub entries: RefCell<HashMap<String, Rc<ObjectState>>>,
}

/// Location of one registered object table
#[derive(Clone, Copy, Debug)]
pub(crate) struct TableHandle {
    pub core: usize,
    pub id: u64,
}

/// Worker-local collection state, owned by the collection's home core
pub(crate) struct CollectionState {
    /// Per-core object tables, indexed by core
    pub tables: Vec<TableHandle>,
}

/// Handle to a collection, usable from any thread
pub struct Collection {
    pool: Arc<ShardPool>,
    home: usize,
    id: u64,
    cid: String,
    tables: Arc<Vec<TableHandle>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("home", &self.home)
            .field("id", &self.id)
            .field("cid", &self.cid)
            .finish()
    }
}

impl Collection {
    pub(crate) fn new(
        pool: Arc<ShardPool>,
        home: usize,
        id: u64,
        cid: String,
        tables: Arc<Vec<TableHandle>>,
    ) -> Self {
        Self {
            pool,
            home,
            id,
            cid,
            tables,
        }
    }

    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Home core of this collection; a pure function of the cid
    #[must_use]
    pub fn home_core(&self) -> usize {
        self.home
    }

    /// Create an object, or open the existing one when not exclusive
    pub async fn create(&self, oid: &str, exclusive: bool) -> Result<Object> {
        if oid.is_empty() || oid.len() > MAX_OBJECT_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "object name must be 1..={MAX_OBJECT_NAME_LEN} bytes"
            )));
        }
        let core = object_core(oid, self.pool.cores());
        let table = self.tables[core];
        let oid_owned = oid.to_string();
        let id = self
            .pool
            .submit_async(core, move |ctx| async move {
                let table = ctx.table(table.id)?;
                if let Some(existing) = table.entries.borrow().get(&oid_owned).cloned() {
                    if exclusive {
                        return Err(Error::ObjectExists(oid_owned));
                    }
                    let id = ctx.alloc_id();
                    ctx.objects.borrow_mut().insert(id, existing);
                    return Ok(id);
                }

                let pages = PageSet::create(&ctx.pool()?).await?;
                let state = ObjectState::new(oid_owned.clone(), Rc::downgrade(&table), pages);
                table
                    .entries
                    .borrow_mut()
                    .insert(oid_owned, state.clone());
                let id = ctx.alloc_id();
                ctx.objects.borrow_mut().insert(id, state);
                Ok(id)
            })
            .await?;
        Ok(Object::new(self.pool.clone(), core, id, oid.to_string()))
    }

    /// Open an existing object
    pub async fn lookup(&self, oid: &str) -> Result<Object> {
        let core = object_core(oid, self.pool.cores());
        let table = self.tables[core];
        let oid_owned = oid.to_string();
        let id = self
            .pool
            .submit(core, move |ctx| {
                let table = ctx.table(table.id)?;
                let state = table
                    .entries
                    .borrow()
                    .get(&oid_owned)
                    .cloned()
                    .ok_or(Error::NoSuchObject(oid_owned))?;
                let id = ctx.alloc_id();
                ctx.objects.borrow_mut().insert(id, state);
                Ok(id)
            })
            .await?;
        Ok(Object::new(self.pool.clone(), core, id, oid.to_string()))
    }

    /// True when no core holds an object for this collection
    pub async fn is_empty(&self) -> Result<bool> {
        let pool = &self.pool;
        let futs = self.tables.iter().map(|&table| {
            pool.submit(table.core, move |ctx| {
                Ok(ctx.table(table.id)?.entries.borrow().is_empty())
            })
        });
        let empties = try_join_all(futs).await?;
        Ok(empties.into_iter().all(|empty| empty))
    }

    /// Remove the collection; fails unless every per-core table is empty
    pub async fn remove(self) -> Result<()> {
        if !self.is_empty().await? {
            return Err(Error::CollectionNotEmpty(self.cid.clone()));
        }
        let pool = &self.pool;
        let futs = self.tables.iter().map(|&table| {
            pool.submit(table.core, move |ctx| {
                ctx.tables.borrow_mut().remove(&table.id);
                Ok(())
            })
        });
        try_join_all(futs).await?;

        let cid = self.cid.clone();
        self.pool
            .submit(self.home, move |ctx| {
                ctx.collections.borrow_mut().remove(&cid);
                Ok(())
            })
            .await
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        let id = self.id;
        self.pool.post(self.home, move |ctx| {
            ctx.collection_handles.borrow_mut().remove(&id);
        });
    }
}
