//! Generic, GPU-agnostic primitives shared by the collective reduction
//! engine: communicator-group keys, the padding/split arithmetic for the
//! hierarchical allreduce, and the LIFO pool container backing the
//! device-event cache.

mod device_key;
mod pool;
mod split;

pub use device_key::DeviceTupleKey;
pub use pool::LifoPool;
pub use split::{compute_split, padded_element_count, Split};
