//! # apply
//!
//! why: push committed entries into the domain state machine in index order
//! relations: run by node.rs after commit_index moves; records outcomes through raft-storage
//! what: apply_committed

use raft_core::{EntryStatus, RaftNode};
use raft_storage::Storage;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::state_machine::StateMachine;

/// Apply every entry in `(last_applied, min(commit_index, log_len)]`.
///
/// A durable machine steps over entries already marked applied; a volatile
/// one sees them again, which rebuilds its state after a restart. A domain
/// rejection marks the entry Failed and the pipeline moves on. A storage
/// failure or a gap stops it. Returns how many indexes advanced.
pub fn apply_committed(
    raft: &mut RaftNode,
    storage: &mut dyn Storage,
    machine: &mut dyn StateMachine,
) -> Result<u64, NodeError> {
    let target = raft.commit_index.min(storage.log_len()?);
    let start = raft.last_applied;
    let durable = machine.is_durable();

    while raft.last_applied < target {
        let batch = storage.entries_between(raft.last_applied, target)?;
        if batch.is_empty() {
            return Err(NodeError::ApplyGap {
                expected: raft.last_applied + 1,
                found: target + 1,
            });
        }

        for entry in batch {
            let expected = raft.last_applied + 1;
            if entry.index != expected {
                return Err(NodeError::ApplyGap { expected, found: entry.index });
            }

            if !(durable && entry.status.is_applied()) {
                let status = match machine.apply(&entry.command) {
                    Ok(()) => EntryStatus::Succeeded,
                    Err(err) => {
                        warn!(index = entry.index, kind = %entry.kind(), error = %err, "command rejected by state machine");
                        EntryStatus::Failed
                    }
                };
                if status != entry.status {
                    storage.set_status(entry.index, status)?;
                }
            }
            raft.last_applied = entry.index;
        }
    }

    let applied = raft.last_applied - start;
    if applied > 0 {
        debug!(last_applied = raft.last_applied, applied, "applied committed entries");
    }
    Ok(applied)
}
