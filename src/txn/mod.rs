//! Transaction / snapshot oracle
//!
//! Supplies transaction ids and command ids, point-in-time snapshots,
//! commit-status lookups and the oldest-active-xid watermark the
//! reclaimer prunes against. Commit and abort fan out to registered
//! end-of-transaction hooks (the chunk store registers its reclaimer
//! there), so the core stays independent of any host event system.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

// ============================================================================
// Transaction ID
// ============================================================================

/// Transaction identifier
pub type TxnId = u64;

/// Command identifier within a transaction
pub type CommandId = u32;

/// Marks "no transaction": an aborted insert resets xmin to this, a chunk
/// with no deleter keeps xmax here.
pub const INVALID_XID: TxnId = 0;

/// A frozen xid is older than every snapshot: permanently visible.
pub const FROZEN_XID: TxnId = 1;

/// First xid the oracle hands out
pub const FIRST_NORMAL_XID: TxnId = 2;

/// Whether the xid refers to some transaction at all (frozen included)
#[inline]
pub fn xid_is_valid(xid: TxnId) -> bool {
    xid != INVALID_XID
}

/// Whether the xid is an ordinary, assignable transaction id
#[inline]
pub fn xid_is_normal(xid: TxnId) -> bool {
    xid >= FIRST_NORMAL_XID
}

/// Transaction ordering; the frozen xid precedes every normal xid
#[inline]
pub fn xid_precedes(a: TxnId, b: TxnId) -> bool {
    a < b
}

// ============================================================================
// Snapshot
// ============================================================================

/// A point-in-time view of which transactions' effects are visible
///
/// Visibility decisions rely solely on the snapshot's own ordering data:
/// anything at or past `xmax`, or listed in `xip`, was in flight when the
/// snapshot was taken and stays invisible to it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Every xid below this had finished when the snapshot was taken
    pub xmin: TxnId,
    /// First xid not yet assigned at snapshot time
    pub xmax: TxnId,
    /// In-flight xids at snapshot time, sorted ascending
    xip: Vec<TxnId>,
    /// Command counter of the owning transaction at snapshot time
    pub curcid: CommandId,
}

impl Snapshot {
    /// Was `xid` still in flight when this snapshot was taken?
    pub fn xid_in_flight(&self, xid: TxnId) -> bool {
        if xid < self.xmin {
            return false;
        }
        if xid >= self.xmax {
            return true;
        }
        self.xip.binary_search(&xid).is_ok()
    }
}

// ============================================================================
// Transaction Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    InProgress,
    Committed,
    Aborted,
}

// ============================================================================
// Oracle
// ============================================================================

type EndHook = Box<dyn Fn(TxnId, bool) + Send + Sync>;

struct OracleState {
    next_xid: TxnId,
    status: AHashMap<TxnId, TxnStatus>,
    /// In-flight transactions, each with the oldest xid that was still
    /// running when it began (the floor of every snapshot it can take)
    active: BTreeMap<TxnId, TxnId>,
}

/// Central authority for transaction ids, status and snapshots
///
/// Thread-safe; hook invocation happens after the state lock is dropped
/// so hooks may query the oracle freely.
pub struct TxnOracle {
    state: RwLock<OracleState>,
    hooks: Mutex<Vec<EndHook>>,
}

impl TxnOracle {
    /// Create an oracle with no transactions started yet
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(OracleState {
                next_xid: FIRST_NORMAL_XID,
                status: AHashMap::new(),
                active: BTreeMap::new(),
            }),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// BEGIN - assign an xid and open a transaction handle
    ///
    /// The transaction's snapshot is fixed here; every command of the
    /// transaction reads the same view (snapshot isolation), only the
    /// command counter moves.
    pub fn begin(self: &Arc<Self>) -> Txn {
        let mut state = self.state.write();
        let xid = state.next_xid;
        state.next_xid += 1;
        state.status.insert(xid, TxnStatus::InProgress);
        let xip: Vec<TxnId> = state.active.keys().copied().collect();
        let snap = Snapshot {
            xmin: xip.first().copied().unwrap_or(xid),
            xmax: state.next_xid,
            xip,
            curcid: 0,
        };
        state.active.insert(xid, snap.xmin);
        Txn {
            oracle: Arc::clone(self),
            xid,
            snap,
            cid: AtomicU32::new(0),
        }
    }

    /// Did the transaction commit? In-progress and aborted both answer no.
    pub fn did_commit(&self, xid: TxnId) -> bool {
        self.state.read().status.get(&xid) == Some(&TxnStatus::Committed)
    }

    /// Is the transaction still in progress?
    pub fn is_in_progress(&self, xid: TxnId) -> bool {
        self.state.read().status.get(&xid) == Some(&TxnStatus::InProgress)
    }

    /// Oldest xid any current or future snapshot might still observe
    ///
    /// Snapshot floors are non-decreasing in begin order, so the entry
    /// with the smallest xid also carries the smallest floor. With no
    /// transaction in flight this is the next unassigned xid: everything
    /// already ended is safely in the past.
    pub fn oldest_active_xid(&self) -> TxnId {
        let state = self.state.read();
        state
            .active
            .values()
            .next()
            .copied()
            .unwrap_or(state.next_xid)
    }

    /// Number of in-flight transactions
    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    /// Register an end-of-transaction hook, invoked on every commit and
    /// abort with the ending xid and a commit/abort discriminator.
    pub fn register_end_hook<F>(&self, hook: F)
    where
        F: Fn(TxnId, bool) + Send + Sync + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    fn end_txn(&self, xid: TxnId, is_commit: bool) {
        {
            let mut state = self.state.write();
            state.status.insert(
                xid,
                if is_commit {
                    TxnStatus::Committed
                } else {
                    TxnStatus::Aborted
                },
            );
            state.active.remove(&xid);
        }
        // Hooks run unlocked: the reclaimer queries the oracle from here.
        for hook in self.hooks.lock().iter() {
            hook(xid, is_commit);
        }
    }
}

// ============================================================================
// Transaction Handle
// ============================================================================

/// An open transaction
///
/// Owns the command counter; commit/abort consume the handle so a
/// finished transaction cannot issue further work.
pub struct Txn {
    oracle: Arc<TxnOracle>,
    xid: TxnId,
    snap: Snapshot,
    cid: AtomicU32,
}

impl Txn {
    /// This transaction's id
    pub fn xid(&self) -> TxnId {
        self.xid
    }

    /// Current command id
    pub fn current_command(&self) -> CommandId {
        self.cid.load(Ordering::Relaxed)
    }

    /// Start the next command within this transaction
    pub fn advance_command(&self) -> CommandId {
        self.cid.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// This transaction's view, stamped with the current command id
    pub fn snapshot(&self) -> Snapshot {
        let mut snap = self.snap.clone();
        snap.curcid = self.current_command();
        snap
    }

    /// COMMIT - record the outcome and notify end hooks
    pub fn commit(self) {
        self.oracle.end_txn(self.xid, true);
    }

    /// ROLLBACK - record the outcome and notify end hooks
    pub fn abort(self) {
        self.oracle.end_txn(self.xid, false);
    }

    /// The oracle this transaction belongs to
    pub fn oracle(&self) -> &Arc<TxnOracle> {
        &self.oracle
    }
}

// ============================================================================
// Tests
// ============================================================================
