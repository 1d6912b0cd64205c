use crate::global_state::GlobalState;
use crate::pipeline::CommRequest;
use crate::transport::Scope;
use collective_core::DeviceTupleKey;

/// Which allreduce strategy a batch runs through (spec §4.7). A tagged
/// variant with free-function stages rather than a trait-object
/// hierarchy, so `Initialize`/`DoAllreduce`/`Finalize` stay plain
/// functions over a shared [`crate::pipeline::PipelineState`] instead of
/// virtual dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllreduceStrategy {
    Flat,
    Hierarchical,
}

/// Picks the highest-priority enabled strategy for a batch, or `None` if
/// the batch is host-placed and no strategy applies.
///
/// Hierarchical is checked first: it is strictly more specific than flat
/// (same device-id condition plus the parameter-manager toggle), so when
/// both are enabled hierarchical wins.
pub fn select(is_cpu: bool, hierarchical_toggle: bool) -> Option<AllreduceStrategy> {
    if hierarchical_enabled(is_cpu, hierarchical_toggle) {
        Some(AllreduceStrategy::Hierarchical)
    } else if flat_enabled(is_cpu) {
        Some(AllreduceStrategy::Flat)
    } else {
        None
    }
}

fn flat_enabled(is_cpu: bool) -> bool {
    !is_cpu
}

fn hierarchical_enabled(is_cpu: bool, hierarchical_toggle: bool) -> bool {
    flat_enabled(is_cpu) && hierarchical_toggle
}

/// Builds the communicator-cache request for `strategy`'s group (spec
/// §4.3 step 1): flat spans every worker, hierarchical spans this node's
/// intra-node peers. `device_of_rank` resolves a global rank to its
/// participating device id, drawn from the batch's [`crate::types::Response`].
pub fn comm_request(
    strategy: AllreduceStrategy,
    global: &GlobalState,
    device_of_rank: impl Fn(usize) -> i32,
) -> CommRequest {
    match strategy {
        AllreduceStrategy::Flat => CommRequest {
            key: DeviceTupleKey::from_devices((0..global.size).map(&device_of_rank).collect()),
            rank_in_group: global.rank,
            group_size: global.size,
            scope: Scope::Global,
        },
        AllreduceStrategy::Hierarchical => CommRequest {
            key: DeviceTupleKey::from_devices(global.local_group_devices(device_of_rank)),
            rank_in_group: global.local_rank,
            group_size: global.local_size,
            scope: Scope::Local,
        },
    }
}
