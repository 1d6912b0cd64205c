use crate::error::Result;
use crate::types::{ElementType, RawBuffer};

/// The peer set a host-transport operation runs over (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every worker.
    Global,
    /// This node's intra-node peers.
    Local,
    /// One peer per node, all sharing this worker's local rank.
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// A freshly generated collective identifier, distributed byte-wise over
/// a [`HostTransport::broadcast`] rendezvous (spec §4.3 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueId(pub Vec<u8>);

/// The CPU-side channel used for identifier broadcast, the rendezvous
/// barrier after communicator init, and the cross-node allreduce in the
/// hierarchical strategy (spec §6). Implementations are assumed blocking
/// and thread-safe among the designated scope's peers; this trait is a
/// contract only, the concrete transport is an external collaborator.
pub trait HostTransport: Send + Sync {
    fn broadcast(&self, buf: &mut [u8], scope: Scope, root: usize) -> Result<()>;
    fn barrier(&self, scope: Scope) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        element_type: ElementType,
        op: ReduceOp,
        scope: Scope,
    ) -> Result<()>;
    fn type_size(&self, element_type: ElementType) -> usize {
        element_type.element_size()
    }
}

/// The device-side capability the engine needs: event/stream primitives
/// (spec §4.1/§4.2), async copies, and the device-native collectives
/// (spec §6). A single trait so the stream/event/communicator types stay
/// consistent across the event pool, stream registry, communicator cache,
/// and allreduce strategies without juggling independent generic
/// parameters. Production code backs this with NCCL/CUDA (the `cuda`
/// feature's `CudaBackend`); tests back it with an in-process loopback.
pub trait DeviceBackend: Send + Sync + 'static {
    type Stream: Send + Sync + std::fmt::Debug;
    type Event: Send + Sync + std::fmt::Debug;
    type Handle: Send + Sync + std::fmt::Debug;

    // --- device/stream/event primitives (§4.1, §4.2) ---
    fn set_device(&self, device: i32) -> Result<()>;
    /// Returns `(least_urgent, most_urgent)` priority values for `device`.
    fn stream_priority_range(&self, device: i32) -> Result<(i32, i32)>;
    fn create_stream(&self, device: i32, priority: i32) -> Result<Self::Stream>;
    fn create_event(&self) -> Result<Self::Event>;
    fn record_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<()>;
    fn synchronize_event(&self, event: &Self::Event) -> Result<()>;

    // --- async copies (§4.4) ---
    fn memcpy_d2d_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()>;
    fn memcpy_d2h_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()>;
    fn memcpy_h2d_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()>;
    fn alloc_host_buffer(&self, bytes: usize) -> Result<RawBuffer>;
    fn free_host_buffer(&self, buf: RawBuffer) -> Result<()>;

    /// Allocates the fusion buffer a batch's entries are concatenated
    /// into. The tensor library itself is an external collaborator
    /// (spec §1); this is the thin slice of device allocation the engine
    /// owns directly, scoped to one job's fusion buffer.
    fn alloc_device_buffer(&self, device: i32, bytes: usize) -> Result<RawBuffer>;
    fn free_device_buffer(&self, device: i32, buf: RawBuffer) -> Result<()>;

    // --- communicator lifecycle (§4.3, §6) ---
    fn generate_unique_id(&self) -> Result<UniqueId>;
    fn init_with_rank(&self, id: &UniqueId, group_size: usize, rank: usize)
    -> Result<Self::Handle>;

    // --- device-native collectives (§6) ---
    #[allow(clippy::too_many_arguments)]
    fn allreduce(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        count: i64,
        element_type: ElementType,
        op: ReduceOp,
        stream: &Self::Stream,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn reduce_scatter(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        recv_count: i64,
        element_type: ElementType,
        op: ReduceOp,
        stream: &Self::Stream,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn allgather(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        send_count: i64,
        element_type: ElementType,
        stream: &Self::Stream,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn reduce_to_one(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        count: i64,
        element_type: ElementType,
        op: ReduceOp,
        root: usize,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn broadcast_device(
        &self,
        comm: &Self::Handle,
        buf: RawBuffer,
        count: i64,
        element_type: ElementType,
        root: usize,
        stream: &Self::Stream,
    ) -> Result<()>;
}
