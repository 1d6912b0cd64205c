use std::sync::{Condvar, Mutex};

/// A reusable, data-carrying barrier: `group_size` threads each call
/// [`Rendezvous::gather`] with their own contribution and all of them
/// receive every contribution back, in rank order. Used to simulate NCCL
/// collectives and the host transport in-process, across worker threads
/// that stand in for separate ranks.
///
/// Safe to call repeatedly (each completed round resets for the next)
/// as long as callers don't start the next round before finishing with
/// the previous round's result, which our strategies never do: each
/// named stage runs before the next is enqueued.
#[derive(Debug)]
pub struct Rendezvous {
    group_size: usize,
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

#[derive(Debug)]
struct RendezvousState {
    generation: usize,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
}

impl Rendezvous {
    pub fn new(group_size: usize) -> Self {
        Self {
            group_size,
            state: Mutex::new(RendezvousState {
                generation: 0,
                arrived: 0,
                slots: vec![None; group_size],
            }),
            cv: Condvar::new(),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Blocks until every rank in the group has called `gather` for this
    /// round, then returns all contributions in rank order.
    pub fn gather(&self, rank: usize, data: Vec<u8>) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let my_generation = state.generation;
        state.slots[rank] = Some(data);
        state.arrived += 1;
        if state.arrived == self.group_size {
            state.generation += 1;
            state.arrived = 0;
            self.cv.notify_all();
        } else {
            while state.generation == my_generation {
                state = self.cv.wait(state).unwrap();
            }
        }
        state
            .slots
            .iter()
            .map(|s| s.clone().expect("rendezvous slot missing after round completed"))
            .collect()
    }
}
