//! Cooperative work-group scheduler
//!
//! A work-group owns its local memory and its work-items, services them
//! through a ready queue in local-id order, coordinates the collective
//! barrier protocol and reports divergence. The scheduler is cooperative:
//! the device steps exactly one work-item at a time, and this module only
//! does the bookkeeping for the resulting state transitions.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Result;
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, Memory};
use crate::ndrange::NDRange;
use crate::notify::Notifier;
use crate::workitem::{State, StepContext, WorkItem};

/// Barrier bookkeeping between the first arrival and the release
#[derive(Debug)]
struct BarrierState {
    /// (instruction id, barrier flags) of the first arrival
    fingerprint: (u64, u32),
    /// The reference barrier instruction
    instruction: crate::workitem::Instruction,
    /// Global/local id of the first arrival, the divergence reference
    reference: ([usize; 3], [usize; 3]),
    /// Item indices blocked at this barrier
    arrived: Vec<usize>,
    /// Set once divergence has been reported; a divergent barrier is
    /// never released
    divergent: bool,
}

/// One tile of the NDRange: local memory plus its work-items
pub struct WorkGroup {
    group_id: [usize; 3],
    ndrange: NDRange,
    local_memory: Memory,
    items: Vec<Box<dyn WorkItem>>,
    ready: VecDeque<usize>,
    barrier: Option<BarrierState>,
    finished: usize,
    notifier: Rc<Notifier>,
}

impl WorkGroup {
    /// Instantiate the work-group at `group_id`, creating its local
    /// memory, allocating the kernel's local buffers and building one
    /// work-item per local id in row-major order.
    pub fn new(
        kernel: &dyn Kernel,
        ndrange: NDRange,
        group_id: [usize; 3],
        notifier: Rc<Notifier>,
    ) -> Result<Self> {
        let mut local_memory = Memory::new(AddressSpace::Local, Rc::clone(&notifier));
        for size in kernel.local_buffer_sizes() {
            local_memory.allocate(size)?;
        }

        let [lx, ly, lz] = ndrange.local_size;
        let mut items = Vec::with_capacity(ndrange.group_items());
        for z in 0..lz {
            for y in 0..ly {
                for x in 0..lx {
                    let local_id = [x, y, z];
                    let global_id = [
                        ndrange.global_offset[0] + group_id[0] * lx + x,
                        ndrange.global_offset[1] + group_id[1] * ly + y,
                        ndrange.global_offset[2] + group_id[2] * lz + z,
                    ];
                    items.push(kernel.create_work_item(
                        ndrange,
                        global_id,
                        local_id,
                        Rc::clone(&notifier),
                    ));
                }
            }
        }

        let ready = (0..items.len()).collect();
        Ok(WorkGroup {
            group_id,
            ndrange,
            local_memory,
            items,
            ready,
            barrier: None,
            finished: 0,
            notifier,
        })
    }

    /// Group id within the NDRange
    #[must_use]
    pub fn group_id(&self) -> [usize; 3] {
        self.group_id
    }

    /// This group's local memory
    #[must_use]
    pub fn local_memory(&self) -> &Memory {
        &self.local_memory
    }

    /// Mutable access to the local memory
    pub fn local_memory_mut(&mut self) -> &mut Memory {
        &mut self.local_memory
    }

    /// Number of work-items in the group
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the group has no work-items (never true for a well-formed
    /// launch)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow the work-item at `index`
    #[must_use]
    pub fn item(&self, index: usize) -> &dyn WorkItem {
        self.items[index].as_ref()
    }

    /// Mutably borrow the work-item at `index`
    pub fn item_mut(&mut self, index: usize) -> &mut dyn WorkItem {
        self.items[index].as_mut()
    }

    /// Linear index of a local id within this group
    #[must_use]
    pub fn item_index(&self, local_id: [usize; 3]) -> usize {
        self.ndrange.local_linear(local_id)
    }

    /// Pop the next ready work-item, checking it out of the queue until
    /// it leaves the `Ready` state (or is requeued by the debugger)
    pub fn next_work_item(&mut self) -> Option<usize> {
        self.ready.pop_front()
    }

    /// Remove `index` from the ready queue if present (debugger checkout)
    pub fn checkout(&mut self, index: usize) {
        if let Some(pos) = self.ready.iter().position(|&i| i == index) {
            self.ready.remove(pos);
        }
    }

    /// Return a still-ready checked-out work-item to the queue
    pub fn requeue(&mut self, index: usize) {
        if self.items[index].state() == State::Ready && !self.ready.contains(&index) {
            self.ready.push_back(index);
        }
    }

    /// Step the work-item at `index` by one instruction and perform the
    /// bookkeeping for any resulting state transition
    pub fn step_item(&mut self, index: usize, global: &mut Memory) -> Result<State> {
        let state = self.items[index].step(StepContext {
            global,
            local: &mut self.local_memory,
        })?;
        match state {
            State::Ready => {}
            State::AtBarrier => self.arrive_at_barrier(index),
            State::Finished => self.finish_item(index),
        }
        Ok(state)
    }

    /// Whether every non-finished work-item is blocked at the same barrier
    #[must_use]
    pub fn has_barrier(&self) -> bool {
        self.barrier
            .as_ref()
            .is_some_and(|b| !b.divergent && b.arrived.len() + self.finished == self.items.len())
    }

    /// Release a complete barrier: every blocked work-item returns to the
    /// ready queue in local-id order, the fingerprint is reset, and the
    /// local access history is cleared (post-barrier accesses must not
    /// race with pre-barrier accesses)
    pub fn clear_barrier(&mut self) {
        let Some(mut barrier) = self.barrier.take() else {
            return;
        };
        barrier.arrived.sort_unstable();
        for index in barrier.arrived {
            self.items[index].clear_barrier();
            self.ready.push_back(index);
        }
        self.local_memory.synchronize();
    }

    fn arrive_at_barrier(&mut self, index: usize) {
        let Some(info) = self.items[index].barrier() else {
            return;
        };
        let fingerprint = (info.instruction.id, info.flags);
        let current_ids = (self.items[index].global_id(), self.items[index].local_id());

        match &mut self.barrier {
            None => {
                self.barrier = Some(BarrierState {
                    fingerprint,
                    instruction: info.instruction,
                    reference: current_ids,
                    arrived: vec![index],
                    divergent: false,
                });
            }
            Some(barrier) => {
                if barrier.fingerprint != fingerprint {
                    self.notifier.divergence(
                        "barrier",
                        describe_work_item(current_ids),
                        describe_work_item(barrier.reference),
                        Some(barrier.instruction.clone()),
                    );
                    barrier.divergent = true;
                }
                barrier.arrived.push(index);
            }
        }

        // the arrival set is complete but part of the group already
        // finished without executing the barrier
        if let Some(barrier) = &mut self.barrier {
            if !barrier.divergent
                && self.finished > 0
                && barrier.arrived.len() + self.finished == self.items.len()
            {
                barrier.divergent = true;
                self.notifier.divergence(
                    "early exit",
                    String::new(),
                    describe_work_item(barrier.reference),
                    Some(barrier.instruction.clone()),
                );
            }
        }
    }

    fn finish_item(&mut self, index: usize) {
        self.finished += 1;
        let current_ids = (self.items[index].global_id(), self.items[index].local_id());
        if let Some(barrier) = &mut self.barrier {
            if !barrier.divergent {
                barrier.divergent = true;
                self.notifier.divergence(
                    "early exit",
                    describe_work_item(current_ids),
                    describe_work_item(barrier.reference),
                    Some(barrier.instruction.clone()),
                );
            }
        }
    }
}

fn describe_work_item((global, local): ([usize; 3], [usize; 3])) -> String {
    format!(
        "Work-item: Global({},{},{}) Local({},{},{})",
        global[0], global[1], global[2], local[0], local[1], local[2]
    )
}
