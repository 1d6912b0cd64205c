use crate::error::Result;
use crate::transport::DeviceBackend;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// One high-priority, non-blocking stream per device, created on first
/// touch (spec §4.2). The engine never shares the training framework's
/// compute stream: doing so would serialize unrelated compute behind
/// collectives and vice versa, killing backprop/comm overlap.
pub struct StreamRegistry<B: DeviceBackend> {
    backend: Arc<B>,
    streams: Mutex<HashMap<i32, Arc<B::Stream>>>,
}

impl<B: DeviceBackend> StreamRegistry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, device: i32) -> Result<Arc<B::Stream>> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(stream) = streams.get(&device) {
            return Ok(stream.clone());
        }
        let (_least, most_urgent) = self.backend.stream_priority_range(device)?;
        let stream = Arc::new(self.backend.create_stream(device, most_urgent)?);
        info!(device, priority = most_urgent, "created collective stream");
        streams.insert(device, stream.clone());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::loopback::LoopbackBackend;

    #[test]
    fn get_or_create_reuses_the_same_stream_for_a_device() {
        let backend = Arc::new(LoopbackBackend::new());
        let registry = StreamRegistry::new(backend);
        let a = registry.get_or_create(0).unwrap();
        let b = registry.get_or_create(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_devices_get_distinct_streams() {
        let backend = Arc::new(LoopbackBackend::new());
        let registry = StreamRegistry::new(backend);
        let a = registry.get_or_create(0).unwrap();
        let b = registry.get_or_create(1).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
