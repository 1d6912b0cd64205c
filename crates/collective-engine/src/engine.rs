use crate::allreduce::strategy::{self, AllreduceStrategy};
use crate::allreduce::{flat, hierarchical};
use crate::config::EngineConfig;
use crate::error::{CollectiveError, Result};
use crate::global_state::GlobalState;
use crate::pipeline::{AsyncReduceJob, CopyDirection, PipelineState, STAGE_MEMCPY_IN, STAGE_MEMCPY_OUT};
use crate::transport::{DeviceBackend, HostTransport};
use crate::types::{Batch, Response, WireTensorEntry};
use collective_core::padded_element_count;
use std::sync::Arc;

/// The top-level entry point wiring a batch through strategy selection,
/// the async pipeline, and the finalizer (spec §2's control flow).
pub struct Engine<B: DeviceBackend> {
    pub pipeline: PipelineState<B>,
    pub global: GlobalState,
    pub config: EngineConfig,
}

impl<B: DeviceBackend> Engine<B> {
    pub fn new(
        backend: Arc<B>,
        host: Arc<dyn HostTransport>,
        global: GlobalState,
        config: EngineConfig,
        finalizer_workers: usize,
    ) -> Self {
        Self {
            pipeline: PipelineState::new(backend, host, finalizer_workers),
            global,
            config,
        }
    }

    /// Runs one batch through: resolve each entry's wire dtype into a
    /// [`Batch`] -> strategy.Enabled() -> Initialize -> MemcpyIn ->
    /// DoAllreduce -> MemcpyOut -> Finalize. An unsupported dtype anywhere
    /// in `entries` is rejected here, before any entry's callback exists
    /// in a job at all (spec §6, §8 scenario 6). Errors after that point
    /// but before `Finalize` abort the batch without firing any callback;
    /// errors after it are delivered through the entries' callbacks
    /// instead (spec §4.8, §7).
    pub fn execute(&self, entries: Vec<WireTensorEntry>, response: Response) -> Result<()> {
        let batch = Batch::from_wire(entries)?;

        let strategy = strategy::select(batch.is_cpu(), self.config.hierarchical_allreduce())
            .ok_or_else(|| {
                CollectiveError::collective_runtime(
                    "select_strategy",
                    "no allreduce strategy is applicable to a host-placed batch",
                )
            })?;

        let device = batch.device_id();
        let element_type = batch.element_type();
        let offsets: Vec<i64> = batch.offsets().into_iter().map(|o| o.element_offset).collect();
        let raw_num_elements = batch.num_elements();
        let entries = batch.into_entries();

        let single_worker = response.world_size() <= 1;
        let comm_request = if single_worker {
            None
        } else {
            Some(strategy::comm_request(strategy, &self.global, |r| {
                response.device_ids[r]
            }))
        };

        let mut job = AsyncReduceJob::initialize(
            &self.pipeline,
            device,
            comm_request.as_ref(),
            self.config.tracing_enabled,
        )?;

        let fusion_elements = if single_worker || strategy == AllreduceStrategy::Flat {
            raw_num_elements
        } else {
            padded_element_count(
                raw_num_elements,
                self.global.local_size,
                self.config.fusion_atom,
                entries.len(),
                self.global.is_homogeneous,
            )
        };

        let fusion_bytes = fusion_elements as usize * element_type.element_size();
        let fusion_buffer = self
            .pipeline
            .backend
            .alloc_device_buffer(device, fusion_bytes)?;
        job.fusion_buffer = Some(fusion_buffer);

        job.memcpy_entries(
            &self.pipeline,
            &entries,
            fusion_buffer,
            &offsets,
            CopyDirection::IntoFusionBuffer,
            STAGE_MEMCPY_IN,
        )?;

        if !single_worker {
            match strategy {
                AllreduceStrategy::Flat => flat::do_allreduce(
                    &mut job,
                    &self.pipeline,
                    fusion_buffer,
                    fusion_elements,
                    element_type,
                )?,
                AllreduceStrategy::Hierarchical => hierarchical::do_allreduce(
                    &mut job,
                    &self.pipeline,
                    fusion_buffer,
                    fusion_elements,
                    element_type,
                    self.global.local_rank,
                    self.global.local_size,
                    self.global.is_homogeneous,
                )?,
            }
        }

        job.memcpy_entries(
            &self.pipeline,
            &entries,
            fusion_buffer,
            &offsets,
            CopyDirection::OutOfFusionBuffer,
            STAGE_MEMCPY_OUT,
        )?;

        job.finalize(&self.pipeline, entries)
    }

    /// Drains every in-flight finalizer before returning, closing the
    /// shutdown race a bare detached thread would leave open.
    pub fn shutdown(self) {
        self.pipeline.finalizer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, StaticParameterManager};
    use crate::testing::loopback::LoopbackCluster;
    use crate::types::{RawBuffer, Response, WireTensorEntry};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn leaked_f32_buffer(values: &[f32]) -> RawBuffer {
        let boxed: Box<[f32]> = values.to_vec().into_boxed_slice();
        RawBuffer(Box::into_raw(boxed) as *mut u8)
    }

    fn leaked_i64_buffer(values: &[i64]) -> RawBuffer {
        let boxed: Box<[i64]> = values.to_vec().into_boxed_slice();
        RawBuffer(Box::into_raw(boxed) as *mut u8)
    }

    #[test]
    fn flat_all_ones_reduces_to_world_size_on_every_worker() {
        let cluster = Arc::new(LoopbackCluster::new(1, 4));
        let response = Response {
            device_ids: (0..4).collect(),
        };

        let handles: Vec<_> = (0..4usize)
            .map(|rank| {
                let cluster = cluster.clone();
                let response = response.clone();
                thread::spawn(move || {
                    let backend = Arc::new(cluster.backend());
                    let host = Arc::new(cluster.host_transport(rank));
                    let global = GlobalState {
                        rank,
                        size: 4,
                        local_rank: rank,
                        local_size: 4,
                        is_homogeneous: true,
                        local_comm_ranks: (0..4).collect(),
                    };
                    let config = EngineConfig::new(StaticParameterManager {
                        hierarchical_allreduce: false,
                    });
                    let engine = Engine::new(backend, host, global, config, 1);

                    let input = leaked_f32_buffer(&[1.0f32; 8]);
                    let (tx, rx) = mpsc::channel();
                    let entry = WireTensorEntry {
                        name: "grad".to_string(),
                        input,
                        output: input,
                        num_elements: 8,
                        dtype: "FLOAT32".to_string(),
                        device_id: rank as i32,
                        callback: Box::new(move |status| tx.send(status.is_ok()).unwrap()),
                    };
                    engine.execute(vec![entry], response).unwrap();
                    assert!(rx.recv().unwrap());

                    let out = unsafe { std::slice::from_raw_parts(input.0 as *const f32, 8) };
                    let result = out.to_vec();
                    engine.shutdown();
                    result
                })
            })
            .collect();

        for handle in handles {
            for v in handle.join().unwrap() {
                assert_eq!(v, 4.0);
            }
        }
    }

    #[test]
    fn flat_int64_asymmetric_input_sums_to_rank_zero_values() {
        let cluster = Arc::new(LoopbackCluster::new(1, 4));
        let response = Response {
            device_ids: (0..4).collect(),
        };

        let handles: Vec<_> = (0..4usize)
            .map(|rank| {
                let cluster = cluster.clone();
                let response = response.clone();
                thread::spawn(move || {
                    let backend = Arc::new(cluster.backend());
                    let host = Arc::new(cluster.host_transport(rank));
                    let global = GlobalState {
                        rank,
                        size: 4,
                        local_rank: rank,
                        local_size: 4,
                        is_homogeneous: true,
                        local_comm_ranks: (0..4).collect(),
                    };
                    let config = EngineConfig::new(StaticParameterManager {
                        hierarchical_allreduce: false,
                    });
                    let engine = Engine::new(backend, host, global, config, 1);

                    let values: Vec<i64> = if rank == 0 {
                        (0..10).collect()
                    } else {
                        vec![0; 10]
                    };
                    let input = leaked_i64_buffer(&values);
                    let (tx, rx) = mpsc::channel();
                    let entry = WireTensorEntry {
                        name: "grad".to_string(),
                        input,
                        output: input,
                        num_elements: 10,
                        dtype: "INT64".to_string(),
                        device_id: rank as i32,
                        callback: Box::new(move |status| tx.send(status.is_ok()).unwrap()),
                    };
                    engine.execute(vec![entry], response).unwrap();
                    assert!(rx.recv().unwrap());

                    let out = unsafe { std::slice::from_raw_parts(input.0 as *const i64, 10) };
                    let result = out.to_vec();
                    engine.shutdown();
                    result
                })
            })
            .collect();

        let expected: Vec<i64> = (0..10).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn single_worker_batch_runs_without_any_collective_call() {
        let cluster = LoopbackCluster::new(1, 1);
        let backend = Arc::new(cluster.backend());
        let host = Arc::new(cluster.host_transport(0));
        let global = GlobalState::single_worker();
        let config = EngineConfig::new(StaticParameterManager {
            hierarchical_allreduce: false,
        });
        let engine = Engine::new(backend.clone(), host, global, config, 1);

        let input = leaked_f32_buffer(&[2.0f32; 4]);
        let (tx, rx) = mpsc::channel();
        let entry = WireTensorEntry {
            name: "solo".to_string(),
            input,
            output: input,
            num_elements: 4,
            dtype: "FLOAT32".to_string(),
            device_id: 0,
            callback: Box::new(move |status| tx.send(status.is_ok()).unwrap()),
        };
        let response = Response { device_ids: vec![0] };
        engine.execute(vec![entry], response).unwrap();
        assert!(rx.recv().unwrap());

        // No communicator should ever have been built.
        assert_eq!(backend.unique_id_generations(), 0);
        let out = unsafe { std::slice::from_raw_parts(input.0 as *const f32, 4) };
        assert_eq!(out, [2.0f32; 4]);
        engine.shutdown();
    }
}
