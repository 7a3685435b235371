//! Snapshot visibility of chunk descriptors
//!
//! A chunk-granular rendition of the classic MVCC tuple test: a chunk is
//! visible when its inserting transaction is known committed before the
//! snapshot and its deleting transaction, if any, is not. Commit status
//! learned along the way is memoized into the descriptor's hint flags so
//! later checks skip the oracle, and stamps from transactions that turn
//! out aborted are cleared to INVALID in place.

use super::chunk::ChunkDescriptor;
use crate::txn::{xid_is_valid, Snapshot, TxnId, TxnOracle, FROZEN_XID, INVALID_XID};

/// Decide whether `chunk` is visible to `snapshot`
///
/// `current_xid` is the caller's own transaction; its uncommitted stamps
/// are judged by command id rather than commit status. Mutates the
/// descriptor's hint flags and may invalidate stamps of aborted
/// transactions, so callers hold the store lock.
pub(crate) fn satisfies_visibility(
    chunk: &mut ChunkDescriptor,
    current_xid: TxnId,
    snapshot: &Snapshot,
    oracle: &TxnOracle,
) -> bool {
    if !chunk.xmin_committed {
        if !xid_is_valid(chunk.xmin) {
            return false;
        }
        if chunk.xmin == current_xid {
            if chunk.cid >= snapshot.curcid {
                return false; // inserted after the snapshot's command
            }
            if !xid_is_valid(chunk.xmax) {
                return true;
            }
            if chunk.xmax != current_xid {
                // Deleting transaction must be our own; treat as aborted
                chunk.xmax = INVALID_XID;
                return true;
            }
            // Deleted by us: visible only if the delete is later than
            // the snapshot's command
            return chunk.cid >= snapshot.curcid;
        } else if snapshot.xid_in_flight(chunk.xmin) {
            return false;
        } else if oracle.did_commit(chunk.xmin) {
            chunk.xmin_committed = true;
        } else {
            // Inserter aborted or crashed
            chunk.xmin = INVALID_XID;
            return false;
        }
    } else if chunk.xmin != FROZEN_XID && snapshot.xid_in_flight(chunk.xmin) {
        return false;
    }

    // Inserter is visible; now the deleter
    if !xid_is_valid(chunk.xmax) {
        return true;
    }
    if !chunk.xmax_committed {
        if chunk.xmax == current_xid {
            // Visible until the deleting command takes effect
            return chunk.cid >= snapshot.curcid;
        }
        if snapshot.xid_in_flight(chunk.xmax) {
            return true;
        }
        if !oracle.did_commit(chunk.xmax) {
            // Deleter aborted; the chunk stays visible
            chunk.xmax = INVALID_XID;
            return true;
        }
        chunk.xmax_committed = true;
    } else if snapshot.xid_in_flight(chunk.xmax) {
        return true;
    }
    false
}
