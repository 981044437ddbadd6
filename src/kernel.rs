//! Kernel and program contracts
//!
//! The loader that parses IR, extracts constants and builds debug line
//! tables lives outside this crate. The device consumes it through these
//! traits: a [`Program`] supplies identity and source text, a [`Kernel`]
//! installs constants, describes local buffers, manufactures work-items
//! and aggregates instruction counts.

use std::rc::Rc;

use crate::error::Result;
use crate::memory::Memory;
use crate::ndrange::NDRange;
use crate::notify::Notifier;
use crate::workitem::WorkItem;

/// Stable identity of a compiled program
///
/// Breakpoints are keyed by program so that re-running the same program
/// preserves them across launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(
    /// Raw identity value, assigned by the loader
    pub u64,
);

/// A compiled program: identity plus source text for the debugger
pub trait Program {
    /// Identity used to key breakpoints
    fn id(&self) -> ProgramId;

    /// Kernel source text, empty when unavailable
    fn source(&self) -> &str;
}

/// A compiled kernel ready to launch
pub trait Kernel {
    /// Kernel function name
    fn name(&self) -> &str;

    /// The program this kernel was compiled from
    fn program(&self) -> &dyn Program;

    /// Install constant buffers into global memory before enumeration.
    /// May fail with a fatal error carrying its source location.
    fn allocate_constants(&self, memory: &mut Memory) -> Result<()>;

    /// Remove the constant buffers installed by
    /// [`Kernel::allocate_constants`]
    fn deallocate_constants(&self, memory: &mut Memory);

    /// Sizes of the kernel's local-address-space buffers, allocated in
    /// order into every fresh work-group local memory (bases are therefore
    /// deterministic per group)
    fn local_buffer_sizes(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Create the work-item with the given ids
    fn create_work_item(
        &self,
        ndrange: NDRange,
        global_id: [usize; 3],
        local_id: [usize; 3],
        notifier: Rc<Notifier>,
    ) -> Box<dyn WorkItem>;

    /// Reset the per-launch instruction histogram
    fn clear_instruction_counts(&self);

    /// Executed-instruction histogram as (opcode name, count) pairs
    fn instruction_counts(&self) -> Vec<(String, u64)>;
}
