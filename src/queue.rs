//! The receiver's table of active publish transactions.
//!
//! Entries are keyed by an opaque random id. The table enforces the
//! single-writer rule: no branch may appear in more than one active entry,
//! checked under the same write lock that inserts the entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use indexmap::IndexSet;
use rand::RngCore;

use crate::api::{ObjectName, RevisionPair};

/// One active publish transaction.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: String,
    /// Branches this publish advances.
    pub update_refs: BTreeMap<String, RevisionPair>,
    /// The object closure backing the refs, deduplicated, in submission order.
    pub objects: IndexSet<ObjectName>,
    finalizing: AtomicBool,
}

impl QueueEntry {
    /// Claim the entry for finalization. Returns `false` if some other
    /// request already did, in which case the caller must back off.
    pub fn begin_finalize(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("branch \"{0}\" is already being updated")]
    BranchBusy(String),
}

/// The entry table. All mutations run under a single writer lock, which is
/// what makes the create-time branch check race-free.
#[derive(Debug, Default)]
pub struct Queue {
    entries: RwLock<HashMap<String, Arc<QueueEntry>>>,
}

fn new_entry_id() -> String {
    let mut raw = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new publish, refusing if any requested branch is already part
    /// of an active entry.
    pub fn create(
        &self,
        update_refs: BTreeMap<String, RevisionPair>,
        objects: impl IntoIterator<Item = ObjectName>,
    ) -> Result<Arc<QueueEntry>, QueueError> {
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values() {
            for branch in update_refs.keys() {
                if entry.update_refs.contains_key(branch) {
                    return Err(QueueError::BranchBusy(branch.clone()));
                }
            }
        }
        let mut id = new_entry_id();
        while entries.contains_key(&id) {
            id = new_entry_id();
        }
        let entry = Arc::new(QueueEntry {
            id,
            update_refs,
            objects: objects.into_iter().collect(),
            finalizing: AtomicBool::new(false),
        });
        entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<QueueEntry>> {
        self.entries.read().unwrap().get(id).cloned()
    }

    /// Drop an entry. Staged files are left on disk for the operator.
    /// Returns `false` when the id was already gone.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.write().unwrap().remove(id).is_some()
    }

    /// Visit every active entry.
    pub fn walk(&self, mut f: impl FnMut(&QueueEntry)) {
        for entry in self.entries.read().unwrap().values() {
            f(entry);
        }
    }
}
