//! Snapshot visibility of chunk versions.
//!
//! A chunk carries a single creation/deletion pair instead of a version
//! chain. [`ChunkVersion::satisfies`] decides visibility the way the host
//! decides it for heap tuples, and sets commit hint bits as a side effect.
//! [`ChunkVersion::on_transaction_end`] applies a commit or abort of the
//! current transaction and decides whether the chunk can be reclaimed.

use serde::{Deserialize, Serialize};

/// 32-bit transaction id with wraparound ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);
    pub const BOOTSTRAP: TransactionId = TransactionId(1);
    pub const FROZEN: TransactionId = TransactionId(2);
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Whether `self` is logically older than `other`. Permanent ids
    /// compare by value; normal ids compare modulo 2^32.
    pub fn precedes(self, other: TransactionId) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Next normal id, skipping the permanent ones on wraparound.
    pub fn next(self) -> TransactionId {
        let next = self.0.wrapping_add(1);
        if next < Self::FIRST_NORMAL.0 {
            Self::FIRST_NORMAL
        } else {
            TransactionId(next)
        }
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command sequence number within a transaction.
pub type CommandId = u32;

/// A reader's view of which transactions are visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every id preceding this one has finished.
    pub xmin: TransactionId,
    /// Every id at or after this one is invisible.
    pub xmax: TransactionId,
    /// Ids in progress when the snapshot was taken.
    pub xip: Vec<TransactionId>,
    /// Current command of the taking transaction.
    pub curcid: CommandId,
}

impl Snapshot {
    /// Whether `xid` counts as still running for this snapshot.
    pub fn xid_in_snapshot(&self, xid: TransactionId) -> bool {
        if xid.precedes(self.xmin) {
            return false;
        }
        if !xid.precedes(self.xmax) {
            return true;
        }
        self.xip.contains(&xid)
    }
}

/// What the store needs to know from the host's transaction manager.
pub trait TransactionOracle {
    fn is_current_transaction(&self, xid: TransactionId) -> bool;

    fn did_commit(&self, xid: TransactionId) -> bool;

    /// Id of the running transaction, assigning one if needed.
    fn current_transaction_id(&self) -> TransactionId;

    fn current_command_id(&self) -> CommandId;
}

/// What a transaction end means for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// No reader can see the chunk any longer; free it.
    Release,
    /// Some state change is still pending; sweep again later.
    KeepWarm,
    /// Nothing left to do until the next insert or delete.
    Settled,
}

/// MVCC stamp of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkVersion {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub cid: CommandId,
    pub xmin_committed: bool,
    pub xmax_committed: bool,
}

impl ChunkVersion {
    /// Fresh stamp of a chunk created by `xmin` at command `cid`.
    pub fn created(xmin: TransactionId, cid: CommandId) -> Self {
        Self {
            xmin,
            cid,
            ..Default::default()
        }
    }

    pub fn satisfies(&mut self, snapshot: &Snapshot, oracle: &dyn TransactionOracle) -> bool {
        if !self.xmin_committed {
            if !self.xmin.is_valid() {
                return false; // aborted or crashed
            }
            if oracle.is_current_transaction(self.xmin) {
                if self.cid >= snapshot.curcid {
                    return false; // inserted after scan started
                }
                if self.xmax == TransactionId::INVALID {
                    return true;
                }
                if !oracle.is_current_transaction(self.xmax) {
                    // deleting subtransaction must have aborted
                    self.xmax = TransactionId::INVALID;
                    return true;
                }
                return self.cid >= snapshot.curcid;
            } else if snapshot.xid_in_snapshot(self.xmin) {
                return false;
            } else if oracle.did_commit(self.xmin) {
                self.xmin_committed = true;
            } else {
                self.xmin = TransactionId::INVALID;
                return false;
            }
        } else if self.xmin != TransactionId::FROZEN && snapshot.xid_in_snapshot(self.xmin) {
            return false; // committed, but not for this snapshot
        }

        if !self.xmax.is_valid() {
            return true;
        }

        if !self.xmax_committed {
            if oracle.is_current_transaction(self.xmax) {
                return self.cid >= snapshot.curcid;
            }
            if snapshot.xid_in_snapshot(self.xmax) {
                return true;
            }
            if !oracle.did_commit(self.xmax) {
                self.xmax = TransactionId::INVALID;
                return true;
            }
            self.xmax_committed = true;
        } else if snapshot.xid_in_snapshot(self.xmax) {
            return true;
        }
        false
    }

    /// Whether a new chunk of the same table, created by the current
    /// transaction, would race with this one: its creator is still running,
    /// or it is live and not deleted by a committed or the current
    /// transaction.
    pub fn blocks_writer(&self, oracle: &dyn TransactionOracle) -> bool {
        if !self.xmin.is_valid() {
            return false;
        }
        let created = self.xmin == TransactionId::FROZEN
            || self.xmin_committed
            || oracle.is_current_transaction(self.xmin)
            || oracle.did_commit(self.xmin);
        if !created || !self.xmax.is_valid() {
            return true;
        }
        !(self.xmax_committed
            || oracle.is_current_transaction(self.xmax)
            || oracle.did_commit(self.xmax))
    }

    /// Apply the end of the current transaction.
    ///
    /// `oldest_xmin` is the oldest transaction any present or future
    /// snapshot may still consider running.
    pub fn on_transaction_end(
        &mut self,
        is_commit: bool,
        oracle: &dyn TransactionOracle,
        oldest_xmin: TransactionId,
    ) -> EndOutcome {
        if oracle.is_current_transaction(self.xmax) {
            if is_commit {
                self.xmax_committed = true;
            } else {
                self.xmax = TransactionId::INVALID;
            }
        }
        if oracle.is_current_transaction(self.xmin) {
            if is_commit {
                self.xmin_committed = true;
            } else {
                return EndOutcome::Release;
            }
        }

        if self.xmax.is_valid() {
            if !self.xmax_committed || !self.xmax.precedes(oldest_xmin) {
                return EndOutcome::KeepWarm;
            }
            return EndOutcome::Release;
        } else if self.xmin.is_normal() {
            if !self.xmin_committed || !self.xmin.precedes(oldest_xmin) {
                return EndOutcome::KeepWarm;
            }
            self.xmin = TransactionId::FROZEN;
        } else if !self.xmin.is_valid() {
            return EndOutcome::Release;
        }
        EndOutcome::Settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Oracle {
        current: TransactionId,
        committed: Vec<TransactionId>,
    }

    impl TransactionOracle for Oracle {
        fn is_current_transaction(&self, xid: TransactionId) -> bool {
            xid.is_valid() && xid == self.current
        }
        fn did_commit(&self, xid: TransactionId) -> bool {
            self.committed.contains(&xid)
        }
        fn current_transaction_id(&self) -> TransactionId {
            self.current
        }
        fn current_command_id(&self) -> CommandId {
            0
        }
    }

    fn snapshot(xmin: u32, xmax: u32, xip: &[u32], curcid: CommandId) -> Snapshot {
        Snapshot {
            xmin: TransactionId(xmin),
            xmax: TransactionId(xmax),
            xip: xip.iter().map(|&x| TransactionId(x)).collect(),
            curcid,
        }
    }

    #[test]
    fn test_precedes_wraps_around() {
        assert!(TransactionId(10).precedes(TransactionId(11)));
        assert!(TransactionId(u32::MAX).precedes(TransactionId(5)));
        assert!(!TransactionId(5).precedes(TransactionId(u32::MAX)));
        assert!(TransactionId::FROZEN.precedes(TransactionId(3)));
        assert_eq!(TransactionId(u32::MAX).next(), TransactionId::FIRST_NORMAL);
    }

    #[test]
    fn test_xid_in_snapshot() {
        let snap = snapshot(10, 20, &[12], 0);
        assert!(!snap.xid_in_snapshot(TransactionId(9)));
        assert!(snap.xid_in_snapshot(TransactionId(12)));
        assert!(!snap.xid_in_snapshot(TransactionId(13)));
        assert!(snap.xid_in_snapshot(TransactionId(20)));
    }

    #[test]
    fn test_own_insert_visible_to_later_command() {
        let oracle = Oracle { current: TransactionId(10), committed: vec![] };
        let mut v = ChunkVersion::created(TransactionId(10), 0);
        assert!(!v.satisfies(&snapshot(10, 11, &[], 0), &oracle));
        assert!(v.satisfies(&snapshot(10, 11, &[], 1), &oracle));

        // Deleted by the same transaction at command 1.
        v.xmax = TransactionId(10);
        v.cid = 1;
        assert!(!v.satisfies(&snapshot(10, 11, &[], 2), &oracle));
    }

    #[test]
    fn test_aborted_creator_is_cleared() {
        let oracle = Oracle { current: TransactionId(20), committed: vec![] };
        let mut v = ChunkVersion::created(TransactionId(10), 0);
        assert!(!v.satisfies(&snapshot(15, 20, &[], 0), &oracle));
        assert_eq!(v.xmin, TransactionId::INVALID);
    }

    #[test]
    fn test_commit_sets_hint_bit() {
        let oracle = Oracle { current: TransactionId(20), committed: vec![TransactionId(10)] };
        let mut v = ChunkVersion::created(TransactionId(10), 0);
        assert!(v.satisfies(&snapshot(15, 20, &[], 0), &oracle));
        assert!(v.xmin_committed);

        // Still running for an older snapshot.
        assert!(!v.satisfies(&snapshot(10, 11, &[10], 0), &oracle));
    }

    #[test]
    fn test_transaction_end_freezes_old_creation() {
        let oracle = Oracle { current: TransactionId(10), committed: vec![] };
        let mut v = ChunkVersion::created(TransactionId(10), 0);
        assert_eq!(
            v.on_transaction_end(true, &oracle, TransactionId(10)),
            EndOutcome::KeepWarm
        );
        assert!(v.xmin_committed);

        let later = Oracle { current: TransactionId(30), committed: vec![] };
        assert_eq!(
            v.on_transaction_end(true, &later, TransactionId(11)),
            EndOutcome::Settled
        );
        assert_eq!(v.xmin, TransactionId::FROZEN);
    }

    #[test]
    fn test_transaction_end_abort_releases_creation() {
        let oracle = Oracle { current: TransactionId(10), committed: vec![] };
        let mut v = ChunkVersion::created(TransactionId(10), 0);
        assert_eq!(
            v.on_transaction_end(false, &oracle, TransactionId(5)),
            EndOutcome::Release
        );
    }

    #[test]
    fn test_transaction_end_abort_undoes_delete() {
        let oracle = Oracle { current: TransactionId(12), committed: vec![] };
        let mut v = ChunkVersion {
            xmin: TransactionId::FROZEN,
            xmax: TransactionId(12),
            xmin_committed: true,
            ..Default::default()
        };
        assert_eq!(
            v.on_transaction_end(false, &oracle, TransactionId(12)),
            EndOutcome::Settled
        );
        assert!(!v.xmax.is_valid());
    }

    #[test]
    fn test_writer_blocked_by_running_creator_and_live_chunk() {
        let oracle = Oracle { current: TransactionId(20), committed: vec![TransactionId(11)] };

        // creator still running
        assert!(ChunkVersion::created(TransactionId(15), 0).blocks_writer(&oracle));
        // committed and live
        assert!(ChunkVersion::created(TransactionId(11), 0).blocks_writer(&oracle));
        // deleted by us
        let deleted = ChunkVersion {
            xmax: TransactionId(20),
            ..ChunkVersion::created(TransactionId(11), 0)
        };
        assert!(!deleted.blocks_writer(&oracle));
        // delete of a running transaction may still abort
        let pending = ChunkVersion {
            xmax: TransactionId(15),
            ..ChunkVersion::created(TransactionId(11), 0)
        };
        assert!(pending.blocks_writer(&oracle));
        assert!(!ChunkVersion::default().blocks_writer(&oracle));
    }
}
