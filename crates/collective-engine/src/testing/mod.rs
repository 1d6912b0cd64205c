//! In-process test doubles for the host transport and device-collective
//! backend. Not gated behind `#[cfg(test)]` so integration tests under
//! `tests/` can build multi-worker scenarios against the real engine code
//! the way `psyche-modeling`'s `DummyModel` lets trainer tests run without
//! a GPU.

pub mod loopback;
pub mod numeric;
pub mod rendezvous;
