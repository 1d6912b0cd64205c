use crate::error::{CollectiveError, Result};
use crate::transport::{DeviceBackend, HostTransport, Scope, UniqueId};
use collective_core::DeviceTupleKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// NCCL's own unique id is 128 bytes; we distribute ours the same way so a
/// production backend can hand the bytes straight to `ncclCommInitRank`.
const UNIQUE_ID_BYTES: usize = 128;

/// Lazily builds and memoizes a collective communicator per device-tuple
/// key (spec §4.3). An entry, once inserted, is never replaced or removed
/// — every subsequent job for that key reuses the same handle.
///
/// No lock wraps the whole build: the engine assumes external
/// serialization (one reduction batch at a time on the submission
/// thread), so two builds for distinct keys never race each other here.
pub struct CommCache<B: DeviceBackend> {
    backend: Arc<B>,
    host: Arc<dyn HostTransport>,
    entries: Mutex<HashMap<DeviceTupleKey, Arc<B::Handle>>>,
}

impl<B: DeviceBackend> CommCache<B> {
    pub fn new(backend: Arc<B>, host: Arc<dyn HostTransport>) -> Self {
        Self {
            backend,
            host,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `key`, building it on miss.
    ///
    /// `this_rank_in_group`/`group_size` locate this worker within the
    /// communicator group being built; `broadcast_scope` is the host
    /// transport scope the unique-id rendezvous and barrier run over.
    pub fn get_or_build(
        &self,
        key: &DeviceTupleKey,
        this_rank_in_group: usize,
        group_size: usize,
        broadcast_scope: Scope,
    ) -> Result<Arc<B::Handle>> {
        if let Some(handle) = self.entries.lock().unwrap().get(key) {
            return Ok(handle.clone());
        }

        debug!(%key, this_rank_in_group, group_size, "building communicator");
        let id = self.negotiate_unique_id(this_rank_in_group, broadcast_scope)?;

        let handle = self
            .backend
            .init_with_rank(&id, group_size, this_rank_in_group)
            .map_err(|e| {
                CollectiveError::collective_runtime("commInitRank", e.to_string())
            })?;

        // Guards a known post-init deadlock in the underlying runtime:
        // every peer must clear init before any peer starts enqueuing
        // work on the new communicator.
        self.host.barrier(broadcast_scope)?;

        let handle = Arc::new(handle);
        let mut entries = self.entries.lock().unwrap();
        let handle = entries.entry(key.clone()).or_insert(handle).clone();
        info!(%key, "communicator ready");
        Ok(handle)
    }

    fn negotiate_unique_id(
        &self,
        this_rank_in_group: usize,
        broadcast_scope: Scope,
    ) -> Result<UniqueId> {
        let mut buf = if this_rank_in_group == 0 {
            let id = self.backend.generate_unique_id()?;
            let mut buf = id.0;
            buf.resize(UNIQUE_ID_BYTES, 0);
            buf
        } else {
            vec![0u8; UNIQUE_ID_BYTES]
        };
        self.host.broadcast(&mut buf, broadcast_scope, 0)?;
        Ok(UniqueId(buf))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::loopback::{LoopbackBackend, LoopbackHostTransport};

    #[test]
    fn identical_keys_build_exactly_one_communicator() {
        let backend = Arc::new(LoopbackBackend::new());
        let host = Arc::new(LoopbackHostTransport::single());
        let cache = CommCache::new(backend.clone(), host);
        let key = DeviceTupleKey::from_devices(vec![0]);

        let first = cache.get_or_build(&key, 0, 1, Scope::Global).unwrap();
        let second = cache.get_or_build(&key, 0, 1, Scope::Global).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(backend.unique_id_generations(), 1);
    }

    #[test]
    fn distinct_keys_build_distinct_communicators() {
        let backend = Arc::new(LoopbackBackend::new());
        let host = Arc::new(LoopbackHostTransport::single());
        let cache = CommCache::new(backend, host);

        let a = cache
            .get_or_build(&DeviceTupleKey::from_devices(vec![0]), 0, 1, Scope::Global)
            .unwrap();
        let b = cache
            .get_or_build(&DeviceTupleKey::from_devices(vec![1]), 0, 1, Scope::Global)
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }
}
