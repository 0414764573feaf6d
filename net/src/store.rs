//! The object store: a `sled`-backed persistent map from inventory vector
//! to serialized object body, plus the concurrent in-memory inventory index
//! kept in sync with it.
//!
//! The `sled::Db` wrapper follows `amunchain`'s `PersistentState` (open at
//! a path, map backend errors through a typed error, `get`/iterate the
//! tree directly) rather than reaching for a multi-file engine.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashSet;
use tokio::time::{interval, Duration};

use crate::error::StoreResult;
use crate::wire_protocol::InventoryVector;

const TREE_NAME: &str = "object_storage";
const GC_INTERVAL: Duration = Duration::from_secs(60);
const EXPIRATION_OFFSET: usize = 8;
const EXPIRATION_LEN: usize = 8;

/// Persistent object storage, backed by a single `sled` tree.
pub struct ObjectStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl ObjectStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(ObjectStore { db, tree })
    }

    pub fn put(&self, vector: &InventoryVector, body: &[u8]) -> StoreResult<()> {
        self.tree.insert(vector.as_bytes(), body)?;
        Ok(())
    }

    pub fn get(&self, vector: &InventoryVector) -> StoreResult<Option<Vec<u8>>> {
        let value = self.tree.get(vector.as_bytes())?;
        Ok(value.map(|v| v.to_vec()))
    }

    pub fn list(&self) -> StoreResult<Vec<InventoryVector>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, _) = entry?;
            let mut vector = [0u8; InventoryVector::LEN];
            vector.copy_from_slice(&key);
            out.push(InventoryVector(vector));
        }
        Ok(out)
    }

    pub fn delete(&self, vector: &InventoryVector) -> StoreResult<()> {
        self.tree.remove(vector.as_bytes())?;
        Ok(())
    }

    pub fn close(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn read_expiration(body: &[u8]) -> Option<i64> {
    let b = body.get(EXPIRATION_OFFSET..EXPIRATION_OFFSET + EXPIRATION_LEN)?;
    Some(i64::from_be_bytes(b.try_into().unwrap()))
}

/// Loads every stored vector into a fresh concurrent index — called once at
/// startup, before accepting any connection.
pub fn load_index(store: &ObjectStore) -> StoreResult<DashSet<InventoryVector>> {
    let index = DashSet::new();
    for vector in store.list()? {
        index.insert(vector);
    }
    Ok(index)
}

/// Runs forever, deleting expired objects from `store` and `index` every
/// [`GC_INTERVAL`]. A failed pass is logged and abandoned; the next tick
/// runs independently of it.
pub async fn run_gc(store: Arc<ObjectStore>, index: Arc<DashSet<InventoryVector>>) {
    let mut ticker = interval(GC_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = gc_pass(&store, &index) {
            log::warn!("garbage collection pass failed: {err}");
        }
    }
}

fn gc_pass(store: &ObjectStore, index: &DashSet<InventoryVector>) -> StoreResult<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    for vector in store.list()? {
        let Some(body) = store.get(&vector)? else { continue };
        let expiration = match read_expiration(&body) {
            Some(e) => e,
            None => continue,
        };
        if expiration <= now {
            store.delete(&vector)?;
            index.remove(&vector);
        }
    }
    Ok(())
}
