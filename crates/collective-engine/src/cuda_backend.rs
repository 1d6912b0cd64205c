//! Production [`DeviceBackend`] wiring real CUDA streams and events
//! (`cudarc`'s driver layer) to real NCCL communicators and collectives
//! (`cudarc`'s `nccl` layer). Only compiled with the `cuda` feature;
//! everything else in this crate, including every test, runs against
//! [`crate::testing::loopback`] instead.

use crate::error::{CollectiveError, Result};
use crate::transport::{DeviceBackend, ReduceOp, UniqueId};
use crate::types::{ElementType, RawBuffer};
use cudarc::driver::result as cu;
use cudarc::driver::sys::{CUevent, CUstream};
use cudarc::nccl::result as nccl;
use cudarc::nccl::sys::{ncclComm_t, ncclDataType_t, ncclRedOp_t, ncclUniqueId};
use std::collections::HashMap;
use std::sync::Mutex;

fn provider_err(op: &'static str, e: impl std::fmt::Display) -> CollectiveError {
    CollectiveError::collective_runtime(op, e.to_string())
}

fn nccl_dtype(element_type: ElementType) -> ncclDataType_t {
    match element_type {
        ElementType::Int32 => ncclDataType_t::ncclInt32,
        ElementType::Int64 => ncclDataType_t::ncclInt64,
        ElementType::Float16 => ncclDataType_t::ncclFloat16,
        ElementType::Float32 => ncclDataType_t::ncclFloat32,
        ElementType::Float64 => ncclDataType_t::ncclFloat64,
    }
}

fn nccl_op(op: ReduceOp) -> ncclRedOp_t {
    match op {
        ReduceOp::Sum => ncclRedOp_t::ncclSum,
        ReduceOp::Mean => ncclRedOp_t::ncclAvg,
    }
}

/// Tracks which device each CUDA context call applies to, the way the
/// other backends in this crate do, so `set_device` is the single place
/// that binds the thread-local CUDA context.
pub struct CudaBackend {
    current_device: Mutex<Option<i32>>,
}

impl CudaBackend {
    pub fn new() -> Self {
        Self {
            current_device: Mutex::new(None),
        }
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for CudaBackend {
    type Stream = CUstream;
    type Event = CUevent;
    type Handle = ncclComm_t;

    fn set_device(&self, device: i32) -> Result<()> {
        cu::ctx::set_current(device)
            .map_err(|e| provider_err("cuCtxSetCurrent", e))?;
        *self.current_device.lock().unwrap() = Some(device);
        Ok(())
    }

    fn stream_priority_range(&self, _device: i32) -> Result<(i32, i32)> {
        cu::stream::priority_range().map_err(|e| provider_err("cuCtxGetStreamPriorityRange", e))
    }

    fn create_stream(&self, _device: i32, priority: i32) -> Result<Self::Stream> {
        cu::stream::create_with_priority(priority)
            .map_err(|e| provider_err("cuStreamCreateWithPriority", e))
    }

    fn create_event(&self) -> Result<Self::Event> {
        cu::event::create_disable_timing().map_err(|e| provider_err("cuEventCreate", e))
    }

    fn record_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<()> {
        cu::event::record(*event, *stream).map_err(|e| provider_err("cuEventRecord", e))
    }

    fn synchronize_event(&self, event: &Self::Event) -> Result<()> {
        cu::event::synchronize(*event).map_err(|e| provider_err("cuEventSynchronize", e))
    }

    fn memcpy_d2d_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        cu::memcpy::d2d_async(dst.0, src.0, bytes, *stream)
            .map_err(|e| provider_err("cuMemcpyDtoDAsync", e))
    }

    fn memcpy_d2h_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        cu::memcpy::d2h_async(dst.0, src.0, bytes, *stream)
            .map_err(|e| provider_err("cuMemcpyDtoHAsync", e))
    }

    fn memcpy_h2d_async(
        &self,
        stream: &Self::Stream,
        dst: RawBuffer,
        src: RawBuffer,
        bytes: usize,
    ) -> Result<()> {
        cu::memcpy::h2d_async(dst.0, src.0, bytes, *stream)
            .map_err(|e| provider_err("cuMemcpyHtoDAsync", e))
    }

    fn alloc_host_buffer(&self, bytes: usize) -> Result<RawBuffer> {
        cu::malloc_host(bytes)
            .map(RawBuffer)
            .map_err(|e| provider_err("cuMemAllocHost", e))
    }

    fn free_host_buffer(&self, buf: RawBuffer) -> Result<()> {
        cu::free_host(buf.0).map_err(|e| provider_err("cuMemFreeHost", e))
    }

    fn alloc_device_buffer(&self, _device: i32, bytes: usize) -> Result<RawBuffer> {
        cu::malloc(bytes)
            .map(RawBuffer)
            .map_err(|e| provider_err("cuMemAlloc", e))
    }

    fn free_device_buffer(&self, _device: i32, buf: RawBuffer) -> Result<()> {
        cu::free(buf.0).map_err(|e| provider_err("cuMemFree", e))
    }

    fn generate_unique_id(&self) -> Result<UniqueId> {
        let id: ncclUniqueId = nccl::get_unique_id().map_err(|e| provider_err("ncclGetUniqueId", e))?;
        Ok(UniqueId(id.internal.to_vec()))
    }

    fn init_with_rank(
        &self,
        id: &UniqueId,
        group_size: usize,
        rank: usize,
    ) -> Result<Self::Handle> {
        let mut internal = [0i8; 128];
        for (slot, byte) in internal.iter_mut().zip(id.0.iter()) {
            *slot = *byte as i8;
        }
        let raw_id = ncclUniqueId { internal };
        nccl::comm_init_rank(group_size as i32, raw_id, rank as i32)
            .map_err(|e| provider_err("ncclCommInitRank", e))
    }

    fn allreduce(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        count: i64,
        element_type: ElementType,
        op: ReduceOp,
        stream: &Self::Stream,
    ) -> Result<()> {
        nccl::all_reduce(
            src.0,
            dst.0,
            count as usize,
            nccl_dtype(element_type),
            nccl_op(op),
            *comm,
            *stream,
        )
        .map_err(|e| provider_err("ncclAllReduce", e))
    }

    fn reduce_scatter(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        recv_count: i64,
        element_type: ElementType,
        op: ReduceOp,
        stream: &Self::Stream,
    ) -> Result<()> {
        nccl::reduce_scatter(
            src.0,
            dst.0,
            recv_count as usize,
            nccl_dtype(element_type),
            nccl_op(op),
            *comm,
            *stream,
        )
        .map_err(|e| provider_err("ncclReduceScatter", e))
    }

    fn allgather(
        &self,
        comm: &Self::Handle,
        src: RawBuffer,
        dst: RawBuffer,
        send_count: i64,
        element_type: ElementType,
        stream: &Self::Stream,
    ) -> Result<()> {
        nccl::all_gather(
            src.0,
            dst.0,
            send_count as usize,
            nccl_dtype(element_type),
            *comm,
            *stream,
        )
        .map_err(|e| provider_err("ncclAllGather", e))
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
        stream: &Self::Stream,
    ) -> Result<()> {
        nccl::reduce(
            src.0,
            dst.0,
            count as usize,
            nccl_dtype(element_type),
            nccl_op(op),
            root as i32,
            *comm,
            *stream,
        )
        .map_err(|e| provider_err("ncclReduce", e))
    }

    fn broadcast_device(
        &self,
        comm: &Self::Handle,
        buf: RawBuffer,
        count: i64,
        element_type: ElementType,
        root: usize,
        stream: &Self::Stream,
    ) -> Result<()> {
        nccl::broadcast(
            buf.0,
            buf.0,
            count as usize,
            nccl_dtype(element_type),
            root as i32,
            *comm,
            *stream,
        )
        .map_err(|e| provider_err("ncclBroadcast", e))
    }
}

// SAFETY: raw CUDA/NCCL handles are process-wide resources identified by
// an opaque pointer/id; the underlying runtimes are documented
// thread-safe for the calls this backend makes (each call binds its own
// device/context first via `set_device`).
unsafe impl Send for CudaBackend {}
unsafe impl Sync for CudaBackend {}
