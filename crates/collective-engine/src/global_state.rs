/// This worker's view of the cluster topology (spec §3). Built once at
/// startup by the external coordinator and handed to the engine; the
/// engine only reads it. Serializable since the coordinator assembles it
/// from a cluster-wide rendezvous and ships it to each worker over the
/// wire.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GlobalState {
    pub rank: usize,
    pub size: usize,
    pub local_rank: usize,
    pub local_size: usize,
    pub is_homogeneous: bool,
    /// For each intra-node rank, the global rank of that peer.
    pub local_comm_ranks: Vec<usize>,
}

impl GlobalState {
    pub fn single_worker() -> Self {
        Self {
            rank: 0,
            size: 1,
            local_rank: 0,
            local_size: 1,
            is_homogeneous: true,
            local_comm_ranks: vec![0],
        }
    }

    /// The global ranks forming this node's intra-node group, sorted so
    /// every peer derives the same communicator key.
    pub fn local_group_devices(&self, device_of_rank: impl Fn(usize) -> i32) -> Vec<i32> {
        self.local_comm_ranks
            .iter()
            .map(|&rank| device_of_rank(rank))
            .collect()
    }
}
