//! An in-process, multi-threaded stand-in for NCCL and the host transport.
//! Each simulated worker runs on its own OS thread and gets its own
//! [`LoopbackBackend`] / [`LoopbackHostTransport`], but they share
//! [`Rendezvous`] objects so collectives actually exchange and reduce
//! data the way the real transports would. This lets the allreduce
//! strategies be exercised end-to-end (spec §8) without real hardware.

use super::numeric::reduce_bytes;
use super::rendezvous::Rendezvous;
use crate::error::Result;
use crate::transport::{DeviceBackend, HostTransport, ReduceOp, Scope, UniqueId};
use crate::types::{ElementType, RawBuffer};
use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Reads `len` bytes out of a loopback-allocated (or caller-owned, for
/// tests) buffer. Exposed crate-wide (and to integration tests) since
/// setting up/asserting on fused buffer contents needs raw access.
pub fn read_bytes(buf: RawBuffer, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(buf.0, len).to_vec() }
}

pub fn write_bytes(buf: RawBuffer, data: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), buf.0, data.len()) }
}

/// Shared communicator registry: every [`LoopbackBackend`] participating
/// in the same test resolves the same [`Rendezvous`] for a given unique
/// id, the way independent NCCL processes do.
#[derive(Default)]
struct World {
    comms: Mutex<HashMap<Vec<u8>, Arc<Rendezvous>>>,
    id_counter: AtomicU64,
    /// Records the layout each loopback allocation was made with, since
    /// `dealloc` must be called with the same layout as `alloc`.
    allocation_sizes: Mutex<HashMap<usize, usize>>,
}

#[derive(Debug)]
pub struct LoopbackEvent {
    recorded: std::sync::atomic::AtomicBool,
}

#[derive(Debug)]
pub struct LoopbackCommHandle {
    rendezvous: Arc<Rendezvous>,
    rank: usize,
    group_size: usize,
}

/// A [`DeviceBackend`] that performs its "device" work as plain heap
/// copies and its "device-native" collectives as real elementwise
/// reductions over a [`Rendezvous`], so tests can assert on actual
/// numbers rather than trusting a no-op stub.
pub struct LoopbackBackend {
    world: Arc<World>,
    unique_id_generations: AtomicUsize,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            world: Arc::new(World::default()),
            unique_id_generations: AtomicUsize::new(0),
        }
    }

    /// A backend that shares its communicator registry with `self`; used
    /// to build the per-worker backends of a [`LoopbackCluster`] so that
    /// unique ids negotiated by one worker resolve to the same
    /// rendezvous on every other worker.
    pub fn sibling(&self) -> Self {
        Self {
            world: self.world.clone(),
            unique_id_generations: AtomicUsize::new(0),
        }
    }

    pub fn unique_id_generations(&self) -> usize {
        self.unique_id_generations.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for LoopbackBackend {
    type Stream = ();
    type Event = LoopbackEvent;
    type Handle = LoopbackCommHandle;

    fn set_device(&self, _device: i32) -> Result<()> {
        Ok(())
    }

    fn stream_priority_range(&self, _device: i32) -> Result<(i32, i32)> {
        // Mirrors cudaDeviceGetStreamPriorityRange: (least urgent, most urgent).
        Ok((0, -1))
    }

    fn create_stream(&self, _device: i32, _priority: i32) -> Result<Self::Stream> {
        Ok(())
    }

    fn create_event(&self) -> Result<Self::Event> {
        Ok(LoopbackEvent {
            recorded: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn record_event(&self, _stream: &Self::Stream, event: &Self::Event) -> Result<()> {
        event.recorded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn synchronize_event(&self, event: &Self::Event) -> Result<()> {
        debug_assert!(event.recorded.load(Ordering::SeqCst));
        Ok(())
    }

    fn memcpy_d2d_async(
        &self,
        _stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        write_bytes(dst, &read_bytes(src, bytes));
        Ok(())
    }

    fn memcpy_d2h_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        self.memcpy_d2d_async(stream, dst, src, bytes)
    }

    fn memcpy_h2d_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        self.memcpy_d2d_async(stream, dst, src, bytes)
    }

    fn alloc_host_buffer(&self, bytes: usize) -> Result<RawBuffer> {
        let size = bytes.max(1);
        let layout = Layout::from_size_align(size, 8).unwrap();
        let ptr = unsafe { alloc(layout) };
        self.world
            .allocation_sizes
            .lock()
            .unwrap()
            .insert(ptr as usize, size);
        Ok(RawBuffer(ptr))
    }

    fn free_host_buffer(&self, buf: RawBuffer) -> Result<()> {
        let size = self
            .world
            .allocation_sizes
            .lock()
            .unwrap()
            .remove(&(buf.0 as usize))
            .expect("freeing a buffer the loopback backend did not allocate");
        let layout = Layout::from_size_align(size, 8).unwrap();
        unsafe { dealloc(buf.0, layout) };
        Ok(())
    }

    fn alloc_device_buffer(&self, _device: i32, bytes: usize) -> Result<RawBuffer> {
        self.alloc_host_buffer(bytes)
    }

    fn free_device_buffer(&self, _device: i32, buf: RawBuffer) -> Result<()> {
        self.free_host_buffer(buf)
    }

    fn generate_unique_id(&self) -> Result<UniqueId> {
        self.unique_id_generations.fetch_add(1, Ordering::SeqCst);
        let n = self.world.id_counter.fetch_add(1, Ordering::SeqCst);
        Ok(UniqueId(n.to_le_bytes().to_vec()))
    }

    fn init_with_rank(
        &self,
        id: &UniqueId,
        group_size: usize,
        rank: usize,
    ) -> Result<Self::Handle> {
        let mut comms = self.world.comms.lock().unwrap();
        let rendezvous = comms
            .entry(id.0.clone())
            .or_insert_with(|| Arc::new(Rendezvous::new(group_size)))
            .clone();
        Ok(LoopbackCommHandle {
            rendezvous,
            rank,
            group_size,
        })
    }

    fn allreduce(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        count: i64,
        element_type: ElementType,
        op: ReduceOp,
        _stream: &Self::Stream,
    ) -> Result<()> {
        let bytes = count as usize * element_type.element_size();
        let mine = read_bytes(src, bytes);
        let all = comm.rendezvous.gather(comm.rank, mine);
        let reduced = reduce_bytes(&all, count as usize, element_type, op)?;
        write_bytes(dst, &reduced);
        Ok(())
    }

    fn reduce_scatter(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        recv_count: i64,
        element_type: ElementType,
        op: ReduceOp,
        _stream: &Self::Stream,
    ) -> Result<()> {
        let elem = element_type.element_size();
        let bytes = recv_count as usize * comm.group_size * elem;
        let mine = read_bytes(src, bytes);
        let all = comm.rendezvous.gather(comm.rank, mine);
        let reduced = reduce_bytes(&all, recv_count as usize * comm.group_size, element_type, op)?;
        let shard_bytes = recv_count as usize * elem;
        let start = comm.rank * shard_bytes;
        write_bytes(dst, &reduced[start..start + shard_bytes]);
        Ok(())
    }

    fn allgather(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        send_count: i64,
        element_type: ElementType,
        _stream: &Self::Stream,
    ) -> Result<()> {
        let bytes = send_count as usize * element_type.element_size();
        let mine = read_bytes(src, bytes);
        let all = comm.rendezvous.gather(comm.rank, mine);
        let mut out = Vec::with_capacity(bytes * comm.group_size);
        for shard in all {
            out.extend(shard);
        }
        write_bytes(dst, &out);
        Ok(())
    }

    fn reduce_to_one(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        count: i64,
        element_type: ElementType,
        op: ReduceOp,
        root: usize,
        _stream: &Self::Stream,
    ) -> Result<()> {
        let bytes = count as usize * element_type.element_size();
        let mine = read_bytes(src, bytes);
        let all = comm.rendezvous.gather(comm.rank, mine);
        if comm.rank == root {
            let reduced = reduce_bytes(&all, count as usize, element_type, op)?;
            write_bytes(dst, &reduced);
        }
        Ok(())
    }

    fn broadcast_device(
        &self,
        comm: &Self::Handle,
        buf: RawBuffer,
        count: i64,
        element_type: ElementType,
        root: usize,
        _stream: &Self::Stream,
    ) -> Result<()> {
        let bytes = count as usize * element_type.element_size();
        let mine = read_bytes(buf, bytes);
        let all = comm.rendezvous.gather(comm.rank, mine);
        write_bytes(buf, &all[root]);
        Ok(())
    }
}

/// A [`HostTransport`] wired to one worker's slice of a
/// [`LoopbackCluster`]'s global/local/cross rendezvous groups.
pub struct LoopbackHostTransport {
    global: Arc<Rendezvous>,
    local: Arc<Rendezvous>,
    cross: Arc<Rendezvous>,
    global_rank: usize,
    local_rank: usize,
    node: usize,
}

impl LoopbackHostTransport {
    /// A degenerate single-worker transport, useful for tests that only
    /// exercise the communicator cache build protocol.
    pub fn single() -> Self {
        Self {
            global: Arc::new(Rendezvous::new(1)),
            local: Arc::new(Rendezvous::new(1)),
            cross: Arc::new(Rendezvous::new(1)),
            global_rank: 0,
            local_rank: 0,
            node: 0,
        }
    }

    fn rank_in_scope(&self, scope: Scope) -> usize {
        match scope {
            Scope::Global => self.global_rank,
            Scope::Local => self.local_rank,
            Scope::Cross => self.node,
        }
    }

    fn group(&self, scope: Scope) -> &Rendezvous {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
            Scope::Cross => &self.cross,
        }
    }
}

impl HostTransport for LoopbackHostTransport {
    fn broadcast(&self, buf: &mut [u8], scope: Scope, root: usize) -> Result<()> {
        let rank = self.rank_in_scope(scope);
        let all = self.group(scope).gather(rank, buf.to_vec());
        buf.copy_from_slice(&all[root]);
        Ok(())
    }

    fn barrier(&self, scope: Scope) -> Result<()> {
        let rank = self.rank_in_scope(scope);
        self.group(scope).gather(rank, Vec::new());
        Ok(())
    }

    fn allreduce(
        &self,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
        count: usize,
        element_type: ElementType,
        op: ReduceOp,
        scope: Scope,
    ) -> Result<()> {
        let rank = self.rank_in_scope(scope);
        let all = self.group(scope).gather(rank, sendbuf.to_vec());
        let reduced = reduce_bytes(&all, count, element_type, op)?;
        recvbuf.copy_from_slice(&reduced);
        Ok(())
    }
}

/// Builds the shared rendezvous groups for a simulated `num_nodes *
/// local_size` worker cluster and hands out per-worker transports/backends.
pub struct LoopbackCluster {
    local_size: usize,
    global: Arc<Rendezvous>,
    locals: Vec<Arc<Rendezvous>>,
    crosses: Vec<Arc<Rendezvous>>,
    backend: LoopbackBackend,
}

impl LoopbackCluster {
    pub fn new(num_nodes: usize, local_size: usize) -> Self {
        let world_size = num_nodes * local_size;
        Self {
            local_size,
            global: Arc::new(Rendezvous::new(world_size)),
            locals: (0..num_nodes)
                .map(|_| Arc::new(Rendezvous::new(local_size)))
                .collect(),
            crosses: (0..local_size)
                .map(|_| Arc::new(Rendezvous::new(num_nodes)))
                .collect(),
            backend: LoopbackBackend::new(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.global.group_size()
    }

    pub fn host_transport(&self, global_rank: usize) -> LoopbackHostTransport {
        let node = global_rank / self.local_size;
        let local_rank = global_rank % self.local_size;
        LoopbackHostTransport {
            global: self.global.clone(),
            local: self.locals[node].clone(),
            cross: self.crosses[local_rank].clone(),
            global_rank,
            local_rank,
            node,
        }
    }

    pub fn backend(&self) -> LoopbackBackend {
        self.backend.sibling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn host_allreduce_sums_across_all_workers() {
        let cluster = Arc::new(LoopbackCluster::new(2, 2));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let cluster = cluster.clone();
                thread::spawn(move || {
                    let host = cluster.host_transport(rank);
                    let send = (rank as f32 + 1.0).to_le_bytes().to_vec();
                    let mut recv = vec![0u8; 4];
                    host.allreduce(
                        &send,
                        &mut recv,
                        1,
                        ElementType::Float32,
                        ReduceOp::Sum,
                        Scope::Global,
                    )
                    .unwrap();
                    f32::from_le_bytes(recv.try_into().unwrap())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 10.0);
        }
    }

    #[test]
    fn cross_scope_groups_peers_with_the_same_local_rank() {
        // 2 nodes x 2 local ranks. Cross group for local_rank 0 is global
        // ranks {0, 2}; for local_rank 1 it's {1, 3}.
        let cluster = Arc::new(LoopbackCluster::new(2, 2));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let cluster = cluster.clone();
                thread::spawn(move || {
                    let host = cluster.host_transport(rank);
                    let send = (rank as i32).to_le_bytes().to_vec();
                    let mut recv = vec![0u8; 4];
                    host.allreduce(
                        &send,
                        &mut recv,
                        1,
                        ElementType::Int32,
                        ReduceOp::Sum,
                        Scope::Cross,
                    )
                    .unwrap();
                    i32::from_le_bytes(recv.try_into().unwrap())
                })
            })
            .collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![2, 4, 2, 4]); // rank0+rank2=2, rank1+rank3=4
    }
}
