//! The two allreduce strategies sharing one pipeline state (spec §4.5-§4.7).

pub mod flat;
pub mod hierarchical;
pub mod strategy;

pub use strategy::{comm_request, select, AllreduceStrategy};
