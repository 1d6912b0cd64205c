use crate::error::Result;
use crate::pipeline::{AsyncReduceJob, PipelineState, STAGE_NCCL_ALLREDUCE};
use crate::transport::{DeviceBackend, ReduceOp};
use crate::types::{ElementType, RawBuffer};

/// Spec §4.5: one device-native sum-allreduce across every worker's
/// device, over the whole fused buffer. Applicable whenever the batch's
/// device id is not the CPU sentinel.
pub fn do_allreduce<B: DeviceBackend>(
    job: &mut AsyncReduceJob<B>,
    state: &PipelineState<B>,
    fusion_buffer: RawBuffer,
    num_elements: i64,
    element_type: ElementType,
) -> Result<()> {
    let comm = job
        .comm
        .clone()
        .expect("flat strategy requires a communicator bound during Initialize");

    state.backend.allreduce(
        &comm,
        fusion_buffer,
        fusion_buffer,
        num_elements,
        element_type,
        ReduceOp::Sum,
        &job.stream,
    )?;
    job.record_event_end(state, STAGE_NCCL_ALLREDUCE)
}
