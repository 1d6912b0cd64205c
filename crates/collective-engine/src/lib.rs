//! GPU-aware collective-reduction engine for synchronous data-parallel
//! training: fuses per-tensor reduction requests into overlapped,
//! cross-node collective operations and delivers per-tensor completion
//! callbacks off the submission thread.

pub mod allreduce;
pub mod comm_cache;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda_backend;
pub mod engine;
pub mod error;
pub mod event_pool;
pub mod global_state;
pub mod pipeline;
pub mod stream_registry;
pub mod testing;
pub mod transport;
pub mod types;

#[cfg(feature = "cuda")]
pub use cuda_backend::CudaBackend;

pub use comm_cache::CommCache;
pub use config::{EngineConfig, ParameterManager, StaticParameterManager, DEFAULT_FUSION_ATOM};
pub use engine::Engine;
pub use error::{CollectiveError, Result};
pub use event_pool::EventPool;
pub use global_state::GlobalState;
pub use pipeline::{AsyncReduceJob, PipelineState};
pub use stream_registry::StreamRegistry;
pub use transport::{DeviceBackend, HostTransport, ReduceOp, Scope, UniqueId};
pub use types::{
    Batch, CompletionCallback, ElementType, EntryOffset, RawBuffer, Response, Status,
    TensorEntry, WireTensorEntry, CPU_DEVICE_ID,
};
