//! Replica state machine
//!
//! ```text
//! from \ to     Initializing  Active  Partial  Listener  Dead
//! Initializing        .           x                         x
//! Active                          .       x        x        x
//! Partial                         x       .                 x
//! Listener                        x                .        x
//! Dead                x                                     .
//! ```
//!
//! Active, Partial and Listener replicas may all be declared Dead by the
//! failure detector. Requesting the state a replica is already in succeeds
//! without a change, so retries after a crash are harmless.

use crate::cluster::{PeerId, ReplicaState, ShardId};
use crate::common::{Error, Result};

/// Is `from -> to` a listed transition?
pub fn is_allowed(from: ReplicaState, to: ReplicaState) -> bool {
    use ReplicaState::*;
    matches!(
        (from, to),
        (Initializing, Active)
            | (Initializing, Dead)
            | (Active, Partial)
            | (Partial, Active)
            | (Partial, Dead)
            | (Active, Dead)
            | (Listener, Dead)
            | (Dead, Initializing)
            | (Active, Listener)
            | (Listener, Active)
    )
}

/// States reachable from `from` in one step
pub fn allowed_targets(from: ReplicaState) -> Vec<ReplicaState> {
    ALL_STATES
        .iter()
        .copied()
        .filter(|to| is_allowed(from, *to))
        .collect()
}

pub const ALL_STATES: [ReplicaState; 5] = [
    ReplicaState::Initializing,
    ReplicaState::Active,
    ReplicaState::Partial,
    ReplicaState::Listener,
    ReplicaState::Dead,
];

/// Validate a requested transition.
///
/// `Ok(true)` means the state changes, `Ok(false)` that the replica is
/// already in the requested state.
pub fn validate_transition(
    shard_id: ShardId,
    peer_id: PeerId,
    from: ReplicaState,
    to: ReplicaState,
) -> Result<bool> {
    if from == to {
        return Ok(false);
    }
    if is_allowed(from, to) {
        Ok(true)
    } else {
        Err(Error::IllegalTransition {
            shard_id,
            peer_id,
            from,
            to,
        })
    }
}
