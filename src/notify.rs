//! In-process event routing with a single subscriber
//!
//! Memory regions and work-groups report illegal accesses, data races and
//! divergence while the device is mid-step. Instead of back-references
//! into the device, every collaborator shares one [`Notifier`]: notifiers
//! push events and set the force-break latch; the device drains and
//! renders the events and is the only reader of the latch.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::memory::AddressSpace;
use crate::workitem::Instruction;

/// Kind of a detected data race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceKind {
    /// One access read, the other wrote
    ReadWrite,
    /// Both accesses wrote
    WriteWrite,
}

impl fmt::Display for RaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceKind::ReadWrite => write!(f, "Read-write"),
            RaceKind::WriteWrite => write!(f, "Write-write"),
        }
    }
}

/// A diagnostic event queued for the device to render
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Load or store outside any live allocation
    MemoryError {
        /// True for a read, false for a write
        read: bool,
        /// Address space of the failing access
        space: AddressSpace,
        /// Failing address
        address: usize,
        /// Access size in bytes
        size: usize,
        /// The faulting instruction, shown in the context block
        instruction: Option<Instruction>,
    },
    /// Conflicting accesses from different work-items or work-groups
    DataRace {
        /// Read-write or write-write
        kind: RaceKind,
        /// Address space the race occurred in
        space: AddressSpace,
        /// First conflicting byte address
        address: usize,
        /// Scalar id of the other work-item, if the scope is a work-item
        last_work_item: Option<usize>,
        /// Scalar id of the other work-group, if the scope is a work-group
        last_work_group: Option<usize>,
        /// The other entity's conflicting instruction
        instruction: Option<Instruction>,
        /// The racing access's own instruction, shown in the context block
        current_instruction: Option<Instruction>,
    },
    /// Work-items of one group diverged at a collective operation
    Divergence {
        /// Divergence kind ("barrier", "early exit", ...)
        kind: String,
        /// Description of the divergent work-item, if known
        current_info: String,
        /// Description of the reference work-item
        previous_info: String,
        /// The reference collective instruction
        instruction: Option<Instruction>,
    },
    /// Generic kernel error reported by the interpreter
    KernelError {
        /// Error title
        message: String,
        /// Optional additional detail
        info: String,
    },
}

/// Device-owned notification channel shared with memories and work-groups
#[derive(Debug, Default)]
pub struct Notifier {
    events: RefCell<VecDeque<Event>>,
    force_break: Cell<bool>,
}

impl Notifier {
    /// Create an empty notifier
    #[must_use]
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Report an invalid load or store
    pub fn memory_error(
        &self,
        read: bool,
        space: AddressSpace,
        address: usize,
        size: usize,
        instruction: Option<Instruction>,
    ) {
        self.push(Event::MemoryError {
            read,
            space,
            address,
            size,
            instruction,
        });
    }

    /// Report a data race against a previously recorded access
    #[allow(clippy::too_many_arguments)]
    pub fn data_race(
        &self,
        kind: RaceKind,
        space: AddressSpace,
        address: usize,
        last_work_item: Option<usize>,
        last_work_group: Option<usize>,
        instruction: Option<Instruction>,
        current_instruction: Option<Instruction>,
    ) {
        self.push(Event::DataRace {
            kind,
            space,
            address,
            last_work_item,
            last_work_group,
            instruction,
            current_instruction,
        });
    }

    /// Report work-group divergence
    pub fn divergence(
        &self,
        kind: &str,
        current_info: String,
        previous_info: String,
        instruction: Option<Instruction>,
    ) {
        self.push(Event::Divergence {
            kind: kind.to_string(),
            current_info,
            previous_info,
            instruction,
        });
    }

    /// Report a generic kernel error
    pub fn error(&self, message: &str, info: &str) {
        self.push(Event::KernelError {
            message: message.to_string(),
            info: info.to_string(),
        });
    }

    /// Drain all queued events in arrival order
    pub fn drain(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// Whether a notification requested a break since the last clear
    #[must_use]
    pub fn force_break(&self) -> bool {
        self.force_break.get()
    }

    /// Clear the force-break latch (continue loop only)
    pub fn clear_force_break(&self) {
        self.force_break.set(false);
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push_back(event);
        self.force_break.set(true);
    }
}
