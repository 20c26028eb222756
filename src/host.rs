//! In-process stand-in for the host database's transaction manager.
//!
//! The store only sees transactions through [`TransactionOracle`]. This
//! module provides a small manager handing out transaction ids, snapshots
//! and commit status, used by the demo binary, the tests and the bench.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::store::mvcc::{CommandId, Snapshot, TransactionId, TransactionOracle};

#[derive(Debug)]
struct ManagerState {
    next_xid: TransactionId,
    /// Running xid -> xmin of its snapshot.
    running: BTreeMap<u32, TransactionId>,
    committed: HashSet<TransactionId>,
}

#[derive(Debug)]
pub struct TransactionManager {
    state: Mutex<ManagerState>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                next_xid: TransactionId::FIRST_NORMAL,
                running: BTreeMap::new(),
                committed: HashSet::new(),
            }),
        }
    }
}

impl TransactionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a transaction; its snapshot is taken right away and kept for
    /// the whole transaction.
    pub fn begin(self: &Arc<Self>) -> Session {
        let mut state = self.state.lock();
        let xid = state.next_xid;
        state.next_xid = xid.next();

        let xip: Vec<TransactionId> = state.running.keys().map(|&x| TransactionId(x)).collect();
        let xmin = xip.iter().copied().min_by(|a, b| {
            if a.precedes(*b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        let xmin = xmin.unwrap_or(xid);
        state.running.insert(xid.0, xmin);
        drop(state);

        debug!(xid = %xid, xmin = %xmin, "Began transaction");
        Session {
            manager: Arc::clone(self),
            xid,
            xmin,
            xip,
            cid: AtomicU32::new(0),
            finished: Mutex::new(false),
        }
    }

    pub fn did_commit(&self, xid: TransactionId) -> bool {
        self.state.lock().committed.contains(&xid)
    }

    /// Oldest transaction any running snapshot may still consider running.
    pub fn oldest_xmin(&self) -> TransactionId {
        let state = self.state.lock();
        state
            .running
            .values()
            .copied()
            .fold(state.next_xid, |oldest, xmin| {
                if xmin.precedes(oldest) {
                    xmin
                } else {
                    oldest
                }
            })
    }

    fn finish(&self, xid: TransactionId, is_commit: bool) {
        let mut state = self.state.lock();
        state.running.remove(&xid.0);
        if is_commit {
            state.committed.insert(xid);
        }
    }
}

/// One host transaction.
#[derive(Debug)]
pub struct Session {
    manager: Arc<TransactionManager>,
    xid: TransactionId,
    xmin: TransactionId,
    xip: Vec<TransactionId>,
    cid: AtomicU32,
    finished: Mutex<bool>,
}

impl Session {
    pub fn xid(&self) -> TransactionId {
        self.xid
    }

    /// The transaction snapshot at the current command.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            xmin: self.xmin,
            xmax: self.xid,
            xip: self.xip.clone(),
            curcid: self.cid.load(Ordering::Acquire),
        }
    }

    /// Make the effects of earlier commands visible to later ones.
    pub fn next_command(&self) -> CommandId {
        self.cid.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn commit(&self) {
        self.end(true);
    }

    pub fn abort(&self) {
        self.end(false);
    }

    fn end(&self, is_commit: bool) {
        let mut finished = self.finished.lock();
        if !*finished {
            self.manager.finish(self.xid, is_commit);
            *finished = true;
            debug!(xid = %self.xid, is_commit, "Ended transaction");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.end(false);
    }
}

impl TransactionOracle for Session {
    fn is_current_transaction(&self, xid: TransactionId) -> bool {
        xid.is_valid() && xid == self.xid
    }

    fn did_commit(&self, xid: TransactionId) -> bool {
        self.manager.did_commit(xid)
    }

    fn current_transaction_id(&self) -> TransactionId {
        self.xid
    }

    fn current_command_id(&self) -> CommandId {
        self.cid.load(Ordering::Acquire)
    }
}
