use crate::comm_cache::CommCache;
use crate::error::Result;
use crate::event_pool::EventPool;
use crate::stream_registry::StreamRegistry;
use crate::transport::{DeviceBackend, HostTransport, Scope};
use crate::types::{offset_buffer, CompletionCallback, RawBuffer, Status, TensorEntry};
use collective_core::DeviceTupleKey;
use std::sync::Arc;
use tracing::{debug_span, trace};

/// The terminal sentinel stage, unnamed per spec §3: its completion
/// dominates all prior stream work and implies the entry output buffers
/// are ready.
pub const TERMINAL_STAGE: Option<&'static str> = None;

pub const STAGE_QUEUE: &str = "queue";
pub const STAGE_MEMCPY_IN: &str = "memcpy_in";
pub const STAGE_MEMCPY_OUT: &str = "memcpy_out";
pub const STAGE_NCCL_ALLREDUCE: &str = "nccl_allreduce";
pub const STAGE_REDUCE_SCATTER: &str = "reduce_scatter";
pub const STAGE_REDUCE_TAIL: &str = "reduce_tail";
pub const STAGE_CROSS_NODE: &str = "cross_node";
pub const STAGE_ALLGATHER: &str = "allgather";
pub const STAGE_BROADCAST_TAIL: &str = "broadcast_tail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Initialized,
    Enqueued,
    Finalizing,
    Done,
    Failed,
}

/// What a communicator group a job's collective step needs looks like,
/// supplied by the strategy (spec §4.3 step 1). `None` means the job
/// needs no communicator at all (the single-worker boundary case, spec
/// §8: "reduces to memcpy-in -> memcpy-out with no collective calls").
pub struct CommRequest {
    pub key: DeviceTupleKey,
    pub rank_in_group: usize,
    pub group_size: usize,
    pub scope: Scope,
}

/// The capability interface strategies are handed by reference rather
/// than owning: acquire a stream, acquire-or-build a communicator,
/// acquire/release an event, submit a finalize job. Keeps the long-lived
/// registries separate from per-job strategy logic and avoids a strategy
/// owning (and cycling back through) the pipeline state.
pub struct PipelineState<B: DeviceBackend> {
    pub backend: Arc<B>,
    pub host: Arc<dyn HostTransport>,
    pub streams: StreamRegistry<B>,
    pub events: Arc<EventPool<B>>,
    pub comms: CommCache<B>,
    pub finalizer: FinalizerExecutor<B>,
}

impl<B: DeviceBackend> PipelineState<B> {
    pub fn new(backend: Arc<B>, host: Arc<dyn HostTransport>, finalizer_workers: usize) -> Self {
        let streams = StreamRegistry::new(backend.clone());
        let events = Arc::new(EventPool::new(backend.clone()));
        let comms = CommCache::new(backend.clone(), host.clone());
        let finalizer = FinalizerExecutor::new(backend.clone(), events.clone(), finalizer_workers);
        Self {
            backend,
            host,
            streams,
            events,
            comms,
            finalizer,
        }
    }

    pub fn acquire_communicator(&self, request: &CommRequest) -> Result<Arc<B::Handle>> {
        self.comms
            .get_or_build(&request.key, request.rank_in_group, request.group_size, request.scope)
    }
}

/// One in-flight reduction job (spec §3/§4.4). Lives entirely on the
/// submission thread until [`AsyncReduceJob::finalize`] hands its event
/// queue to the [`FinalizerExecutor`].
pub struct AsyncReduceJob<B: DeviceBackend> {
    pub state: JobState,
    pub device: i32,
    pub stream: Arc<B::Stream>,
    pub comm: Option<Arc<B::Handle>>,
    pub queue: Vec<(Option<&'static str>, B::Event)>,
    /// The job-scoped device fusion buffer entries are copied into/out of.
    /// Freed by the finalizer once the terminal event has synchronized.
    pub fusion_buffer: Option<RawBuffer>,
    /// The hierarchical strategy's cross-node host staging buffer (spec
    /// §4.6 phase 3a), present only on that path.
    pub host_buffer: Option<(RawBuffer, usize)>,
    tracing_enabled: bool,
}

impl<B: DeviceBackend> AsyncReduceJob<B> {
    /// Step 1: set the device, resolve the stream, resolve-or-build the
    /// communicator, start a fresh event queue. Records a "queue" event
    /// immediately when tracing is enabled, so the timeline shows
    /// stream-enqueue latency (spec §4.4).
    pub fn initialize(
        state: &PipelineState<B>,
        device: i32,
        comm_request: Option<&CommRequest>,
        tracing_enabled: bool,
    ) -> Result<Self> {
        state.backend.set_device(device)?;
        let stream = state.streams.get_or_create(device)?;
        let comm = comm_request
            .map(|req| state.acquire_communicator(req))
            .transpose()?;
        let mut job = Self {
            state: JobState::Created,
            device,
            stream,
            comm,
            queue: Vec::new(),
            fusion_buffer: None,
            host_buffer: None,
            tracing_enabled,
        };
        if tracing_enabled {
            job.record_event_end(state, STAGE_QUEUE)?;
        }
        job.state = JobState::Initialized;
        Ok(job)
    }

    /// Appends a stage-named event to the queue only when tracing is
    /// initialized, so the untraced critical path pays no event cost
    /// (spec §4.4).
    pub fn record_event_end(&mut self, state: &PipelineState<B>, stage: &'static str) -> Result<()> {
        if !self.tracing_enabled {
            return Ok(());
        }
        let event = state.events.acquire(self.device)?;
        state.backend.record_event(&self.stream, &event)?;
        self.queue.push((Some(stage), event));
        Ok(())
    }

    /// Step 2/4: enqueues one async device-to-device copy per entry,
    /// between its own buffer and its offset in the fusion buffer.
    pub fn memcpy_entries(
        &mut self,
        state: &PipelineState<B>,
        entries: &[TensorEntry],
        fusion_buffer: RawBuffer,
        offsets: &[i64],
        direction: CopyDirection,
        stage: &'static str,
    ) -> Result<()> {
        for (entry, &offset) in entries.iter().zip(offsets) {
            let fusion_slot = offset_buffer(fusion_buffer, offset, entry.element_type);
            let bytes = entry.size_bytes();
            match direction {
                CopyDirection::IntoFusionBuffer => {
                    state
                        .backend
                        .memcpy_d2d_async(&self.stream, fusion_slot, entry.input, bytes)?
                }
                CopyDirection::OutOfFusionBuffer => {
                    state
                        .backend
                        .memcpy_d2d_async(&self.stream, entry.output, fusion_slot, bytes)?
                }
            }
        }
        self.record_event_end(state, stage)
    }

    /// Blocks the submission thread until every event recorded so far has
    /// completed, without releasing them — the finalizer still owns
    /// draining and releasing the full queue later. Used only by the
    /// hierarchical strategy's cross-node phase (spec §4.6 phase 3b),
    /// the sole mid-job host synchronization the pipeline performs.
    pub fn wait_for_recorded_events(&self, state: &PipelineState<B>) -> Result<()> {
        for (_, event) in &self.queue {
            state.backend.synchronize_event(event)?;
        }
        Ok(())
    }

    /// Step 5: enqueues the terminal sentinel event and hands the job off
    /// to the finalizer executor. Always records the sentinel, tracing or
    /// not, since its completion is how the engine knows the job is done.
    pub fn finalize(
        mut self,
        state: &PipelineState<B>,
        entries: Vec<TensorEntry>,
    ) -> Result<()> {
        self.state = JobState::Enqueued;
        let event = state.events.acquire(self.device)?;
        state.backend.record_event(&self.stream, &event)?;
        self.queue.push((TERMINAL_STAGE, event));
        self.state = JobState::Finalizing;

        state.finalizer.submit(FinalizeJob {
            device: self.device,
            queue: self.queue,
            fusion_buffer: self.fusion_buffer,
            host_buffer: self.host_buffer,
            entries,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CopyDirection {
    IntoFusionBuffer,
    OutOfFusionBuffer,
}

pub struct FinalizeJob<B: DeviceBackend> {
    pub device: i32,
    pub queue: Vec<(Option<&'static str>, B::Event)>,
    pub fusion_buffer: Option<RawBuffer>,
    pub host_buffer: Option<(RawBuffer, usize)>,
    pub entries: Vec<TensorEntry>,
}

/// Owns the detached-helper pool. Replaces a bare `std::thread::spawn`
/// fire-and-forget with an explicit pool the engine can drain at
/// shutdown, closing the race a detached thread leaves open between
/// process teardown and an in-flight finalizer.
pub struct FinalizerExecutor<B: DeviceBackend> {
    sender: flume::Sender<FinalizeJob<B>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl<B: DeviceBackend> FinalizerExecutor<B> {
    pub fn new(backend: Arc<B>, events: Arc<EventPool<B>>, num_workers: usize) -> Self {
        let (sender, receiver) = flume::unbounded::<FinalizeJob<B>>();
        let workers = (0..num_workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let backend = backend.clone();
                let events = events.clone();
                std::thread::Builder::new()
                    .name(format!("reduce-finalizer-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            run_finalize(&*backend, &*events, job);
                        }
                    })
                    .expect("failed to spawn finalizer thread")
            })
            .collect();
        Self { sender, workers }
    }

    pub fn submit(&self, job: FinalizeJob<B>) {
        // The channel only closes when every sender (including this one)
        // is dropped, which happens in `shutdown`; submitting after that
        // point is a caller bug.
        let _ = self.sender.send(job);
    }

    /// Closes the submission channel and blocks until every outstanding
    /// finalizer has drained its job and fired its callbacks.
    pub fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn run_finalize<B: DeviceBackend>(backend: &B, events: &EventPool<B>, job: FinalizeJob<B>) {
    if let Err(e) = backend.set_device(job.device) {
        fail_all(job.entries, e.to_string());
        return;
    }

    for (stage, event) in job.queue {
        let span = stage.map(|name| debug_span!("collective_stage", stage = name).entered());
        if let Err(e) = backend.synchronize_event(&event) {
            drop(span);
            fail_all(job.entries, e.to_string());
            return;
        }
        drop(span);
        events.release(job.device, event);
    }

    if let Some((buf, _bytes)) = job.host_buffer {
        if let Err(e) = backend.free_host_buffer(buf) {
            trace!(error = %e, "failed to free hierarchical host buffer");
        }
    }

    if let Some(buf) = job.fusion_buffer {
        if let Err(e) = backend.free_device_buffer(job.device, buf) {
            trace!(error = %e, "failed to free fusion buffer");
        }
    }

    for entry in job.entries {
        entry.fire(Status::Ok);
    }
}

fn fail_all(entries: Vec<TensorEntry>, message: String) {
    for entry in entries {
        let status = Status::Err(crate::error::CollectiveError::collective_runtime(
            "finalize",
            message.clone(),
        ));
        entry.fire(status);
    }
}

/// Convenience used by callers constructing a [`TensorEntry`] whose
/// callback is a plain boxed closure.
pub fn boxed_callback(f: impl FnOnce(Status) + Send + 'static) -> CompletionCallback {
    Box::new(f)
}
