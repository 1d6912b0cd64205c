use crate::error::CollectiveError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel device id denoting host placement (spec §6).
pub const CPU_DEVICE_ID: i32 = -1;

/// Element types the engine will fuse and reduce. Anything else is a fatal
/// [`CollectiveError::UnsupportedType`] before a job is ever enqueued.
/// Serializable since a coordinator reports a batch's dtype over the wire
/// before the engine ever sees the entries themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl ElementType {
    pub fn element_size(self) -> usize {
        match self {
            ElementType::Int32 | ElementType::Float32 => 4,
            ElementType::Int64 | ElementType::Float64 => 8,
            ElementType::Float16 => 2,
        }
    }

    /// Mirrors the provider-visible type name used in
    /// `"Type X is not supported in NCCL mode."` style fatal errors.
    pub fn name(self) -> &'static str {
        match self {
            ElementType::Int32 => "INT32",
            ElementType::Int64 => "INT64",
            ElementType::Float16 => "FLOAT16",
            ElementType::Float32 => "FLOAT32",
            ElementType::Float64 => "FLOAT64",
        }
    }
}

/// Raised when the coordinator hands the engine a tensor whose dtype isn't
/// one of the five supported [`ElementType`]s (spec §6).
pub fn unsupported_type_error(kind: &str) -> CollectiveError {
    CollectiveError::unsupported_type(kind)
}

impl std::str::FromStr for ElementType {
    type Err = CollectiveError;

    /// Resolves a wire-reported dtype tag into an `ElementType`, the one
    /// place an unsupported dtype can actually surface as a fatal error
    /// rather than a value this enum could even represent (spec §6).
    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "INT32" => Ok(ElementType::Int32),
            "INT64" => Ok(ElementType::Int64),
            "FLOAT16" => Ok(ElementType::Float16),
            "FLOAT32" => Ok(ElementType::Float32),
            "FLOAT64" => Ok(ElementType::Float64),
            other => Err(unsupported_type_error(other)),
        }
    }
}

/// The outcome delivered to a [`TensorEntry`]'s completion callback.
/// Only the happy path is exercised today; the `Err` arm exists so a
/// caller can make finalizer-thread failures non-fatal (spec §7,
/// `CallbackDelivered`).
#[derive(Debug)]
pub enum Status {
    Ok,
    Err(CollectiveError),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// A raw, engine-owned-for-the-duration-of-the-job pointer into caller
/// memory. The engine never allocates or frees the pointee; it only reads
/// (input) or writes (output) through it between `Initialize` and the
/// finalizer's callback invocation.
///
/// # Safety
/// The caller guarantees the pointee remains valid and is not aliased for
/// conflicting access until the entry's callback fires.
#[derive(Clone, Copy)]
pub struct RawBuffer(pub *mut u8);

// SAFETY: a `RawBuffer` is just an address; the invariants above make it
// safe to hand across the submission/finalizer thread boundary.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBuffer({:p})", self.0)
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Status) + Send + 'static>;

/// Offsets `buf` by `element_offset` elements of `element_type`, for
/// addressing a shard or tail region within a fusion buffer.
pub fn offset_buffer(buf: RawBuffer, element_offset: i64, element_type: ElementType) -> RawBuffer {
    let byte_offset = element_offset as usize * element_type.element_size();
    RawBuffer(unsafe { buf.0.add(byte_offset) })
}

/// One tensor's worth of reduction work. Externally owned: the engine
/// requires `input`/`output` remain valid until `callback` fires (spec §3).
pub struct TensorEntry {
    pub name: String,
    pub input: RawBuffer,
    pub output: RawBuffer,
    pub num_elements: i64,
    pub element_type: ElementType,
    /// `CPU_DEVICE_ID` denotes host placement.
    pub device_id: i32,
    pub callback: CompletionCallback,
}

impl fmt::Debug for TensorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorEntry")
            .field("name", &self.name)
            .field("num_elements", &self.num_elements)
            .field("element_type", &self.element_type)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl TensorEntry {
    pub fn size_bytes(&self) -> usize {
        self.num_elements as usize * self.element_type.element_size()
    }

    pub fn fire(self, status: Status) {
        (self.callback)(status)
    }
}

/// A [`TensorEntry`] as the external coordinator actually submits it: the
/// dtype is an untyped wire tag (e.g. `"FLOAT32"`) rather than an already-
/// validated `ElementType`, since `ElementType` itself has no variant an
/// unsupported dtype could be parsed into. Resolving `dtype` is the
/// engine's one fallible ingestion boundary (spec §6).
pub struct WireTensorEntry {
    pub name: String,
    pub input: RawBuffer,
    pub output: RawBuffer,
    pub num_elements: i64,
    pub dtype: String,
    pub device_id: i32,
    pub callback: CompletionCallback,
}

impl TryFrom<WireTensorEntry> for TensorEntry {
    type Error = CollectiveError;

    fn try_from(wire: WireTensorEntry) -> Result<Self, Self::Error> {
        let element_type: ElementType = wire.dtype.parse()?;
        Ok(TensorEntry {
            name: wire.name,
            input: wire.input,
            output: wire.output,
            num_elements: wire.num_elements,
            element_type,
            device_id: wire.device_id,
            callback: wire.callback,
        })
    }
}

/// An ordered, non-empty sequence of [`TensorEntry`] sharing element type
/// and device id (spec §3). Iteration order defines the fusion-buffer
/// layout: entries are concatenated with element-sized alignment, and the
/// first entry supplies the element-type metadata for the whole batch.
#[derive(Debug)]
pub struct Batch {
    entries: Vec<TensorEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EntryOffset {
    pub entry_index: usize,
    pub element_offset: i64,
}

impl Batch {
    pub fn new(entries: Vec<TensorEntry>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        let element_type = entries[0].element_type;
        let device_id = entries[0].device_id;
        if entries
            .iter()
            .any(|e| e.element_type != element_type || e.device_id != device_id)
        {
            return None;
        }
        Some(Self { entries })
    }

    /// Resolves every entry's wire dtype tag and validates the batch in a
    /// single fallible pass. This is the boundary `Engine::execute` calls:
    /// an unsupported dtype anywhere in the batch aborts the whole batch
    /// before any entry's callback can fire (spec §6, §8 scenario 6).
    pub fn from_wire(entries: Vec<WireTensorEntry>) -> Result<Self, CollectiveError> {
        let entries = entries
            .into_iter()
            .map(TensorEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Batch::new(entries).ok_or_else(|| {
            CollectiveError::collective_runtime(
                "validate_batch",
                "batch is empty or entries disagree on element type/device",
            )
        })
    }

    pub fn entries(&self) -> &[TensorEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TensorEntry> {
        self.entries
    }

    pub fn element_type(&self) -> ElementType {
        self.entries[0].element_type
    }

    pub fn device_id(&self) -> i32 {
        self.entries[0].device_id
    }

    pub fn is_cpu(&self) -> bool {
        self.device_id() == CPU_DEVICE_ID
    }

    /// Total elements across all entries, ignoring any hierarchical padding.
    pub fn num_elements(&self) -> i64 {
        self.entries.iter().map(|e| e.num_elements).sum()
    }

    /// Per-entry element offset into the fusion buffer, in iteration order.
    pub fn offsets(&self) -> Vec<EntryOffset> {
        let mut offset = 0i64;
        self.entries
            .iter()
            .enumerate()
            .map(|(entry_index, entry)| {
                let element_offset = offset;
                offset += entry.num_elements;
                EntryOffset {
                    entry_index,
                    element_offset,
                }
            })
            .collect()
    }
}

/// Produced by the external coordinator: the ordered device ids
/// participating in a batch, one per worker rank (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub device_ids: Vec<i32>,
}

impl Response {
    pub fn world_size(&self) -> usize {
        self.device_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, n: i64, elem: ElementType, device: i32) -> TensorEntry {
        TensorEntry {
            name: name.to_string(),
            input: RawBuffer(std::ptr::null_mut()),
            output: RawBuffer(std::ptr::null_mut()),
            num_elements: n,
            element_type: elem,
            device_id: device,
            callback: Box::new(|_| {}),
        }
    }

    #[test]
    fn batch_rejects_empty_entries() {
        assert!(Batch::new(vec![]).is_none());
    }

    #[test]
    fn batch_rejects_mixed_element_types() {
        let entries = vec![
            entry("a", 1, ElementType::Float32, 0),
            entry("b", 1, ElementType::Int32, 0),
        ];
        assert!(Batch::new(entries).is_none());
    }

    #[test]
    fn batch_rejects_mixed_devices() {
        let entries = vec![
            entry("a", 1, ElementType::Float32, 0),
            entry("b", 1, ElementType::Float32, 1),
        ];
        assert!(Batch::new(entries).is_none());
    }

    #[test]
    fn offsets_concatenate_in_iteration_order() {
        let entries = vec![
            entry("a", 4, ElementType::Float32, 0),
            entry("b", 6, ElementType::Float32, 0),
        ];
        let batch = Batch::new(entries).unwrap();
        let offsets = batch.offsets();
        assert_eq!(offsets[0].element_offset, 0);
        assert_eq!(offsets[1].element_offset, 4);
        assert_eq!(batch.num_elements(), 10);
    }

    #[test]
    fn unsupported_type_error_message_names_the_type() {
        let err = unsupported_type_error("INT8");
        assert!(err.to_string().contains("INT8"));
    }

    fn wire_entry(name: &str, n: i64, dtype: &str, device: i32) -> WireTensorEntry {
        WireTensorEntry {
            name: name.to_string(),
            input: RawBuffer(std::ptr::null_mut()),
            output: RawBuffer(std::ptr::null_mut()),
            num_elements: n,
            dtype: dtype.to_string(),
            device_id: device,
            callback: Box::new(|_| {}),
        }
    }

    #[test]
    fn supported_dtype_tags_resolve_to_the_matching_element_type() {
        let entry = TensorEntry::try_from(wire_entry("a", 4, "FLOAT32", 0)).unwrap();
        assert_eq!(entry.element_type, ElementType::Float32);
    }

    #[test]
    fn batch_from_wire_rejects_an_unsupported_dtype_tag() {
        let err = Batch::from_wire(vec![wire_entry("a", 4, "INT8", 0)]).unwrap_err();
        assert!(matches!(err, CollectiveError::UnsupportedType { .. }));
        assert_eq!(err.to_string(), "Type INT8 is not supported in NCCL mode.");
    }

    #[test]
    fn batch_from_wire_accepts_a_homogeneous_multi_entry_batch() {
        let batch = Batch::from_wire(vec![
            wire_entry("a", 4, "FLOAT32", 0),
            wire_entry("b", 6, "FLOAT32", 0),
        ])
        .unwrap();
        assert_eq!(batch.num_elements(), 10);
    }
}
