//! Work-item execution contract
//!
//! The per-instruction IR interpreter lives outside this crate; the
//! execution core drives it through the [`WorkItem`] trait. The types in
//! this module are the core's view of the interpreter: a small closed
//! execution [`State`], an [`Instruction`] descriptor carrying debug
//! metadata, and the typed [`Value`] model used by the debugger's
//! `print` command.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{AddressSpace, Memory};

/// Execution state of one work-item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Runnable; the scheduler may step it
    Ready,
    /// Blocked at a work-group barrier
    AtBarrier,
    /// Reached the end of the kernel function
    Finished,
}

/// Source location attached to an instruction by debug metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// 1-based source line
    pub line: usize,
    /// Source file name
    pub file: String,
}

/// The core's view of one IR instruction
///
/// `id` is unique within a program and is the identity used for barrier
/// fingerprints; `text` is the printable dump shown in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Identity of the instruction within its program
    pub id: u64,
    /// Printable dump of the instruction
    pub text: String,
    /// Name of the enclosing function
    pub function: String,
    /// Debug location, if the program carries debug metadata
    pub location: Option<SourceLocation>,
}

impl Instruction {
    /// Source line of this instruction, or 0 without debug metadata
    #[must_use]
    pub fn line(&self) -> usize {
        self.location.as_ref().map_or(0, |loc| loc.line)
    }
}

/// A barrier a work-item is blocked at: the barrier instruction plus its
/// memory-fence flags. The pair `(instruction.id, flags)` is the barrier
/// fingerprint compared across a work-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierInfo {
    /// The barrier instruction itself
    pub instruction: Instruction,
    /// Barrier memory-fence flags
    pub flags: u32,
}

/// Scalar type model for typed value rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Integer of `bytes` width
    Int {
        /// Width in bytes (1, 2, 4 or 8)
        bytes: usize,
        /// Signedness
        signed: bool,
    },
    /// IEEE float of `bytes` width (4 or 8)
    Float {
        /// Width in bytes
        bytes: usize,
    },
    /// Pointer into an address space
    Pointer {
        /// Address space the pointer refers to
        space: AddressSpace,
        /// Pointee type
        elem: Box<DataType>,
    },
}

impl DataType {
    /// Size of a value of this type in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            DataType::Int { bytes, .. } | DataType::Float { bytes } => *bytes,
            DataType::Pointer { .. } => 8,
        }
    }

    /// Render raw little-endian bytes as a value of this type
    #[must_use]
    pub fn format_data(&self, data: &[u8]) -> String {
        if data.len() < self.size() {
            return "<invalid>".to_string();
        }
        match self {
            DataType::Int { bytes: 1, signed: true } => i8::from_le_bytes([data[0]]).to_string(),
            DataType::Int { bytes: 1, signed: false } => data[0].to_string(),
            DataType::Int { bytes: 2, signed } => {
                let raw = [data[0], data[1]];
                if *signed {
                    i16::from_le_bytes(raw).to_string()
                } else {
                    u16::from_le_bytes(raw).to_string()
                }
            }
            DataType::Int { bytes: 8, signed } => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[..8]);
                if *signed {
                    i64::from_le_bytes(raw).to_string()
                } else {
                    u64::from_le_bytes(raw).to_string()
                }
            }
            DataType::Int { signed, .. } => {
                // 4 bytes and any unexpected width collapse to 32 bits
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[..4]);
                if *signed {
                    i32::from_le_bytes(raw).to_string()
                } else {
                    u32::from_le_bytes(raw).to_string()
                }
            }
            DataType::Float { bytes: 8 } => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[..8]);
                f64::from_le_bytes(raw).to_string()
            }
            DataType::Float { .. } => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[..4]);
                f32::from_le_bytes(raw).to_string()
            }
            DataType::Pointer { .. } => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[..8]);
                format!("0x{:X}", u64::from_le_bytes(raw))
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int { bytes, signed: true } => write!(f, "i{}", bytes * 8),
            DataType::Int { bytes, signed: false } => write!(f, "u{}", bytes * 8),
            DataType::Float { bytes } => write!(f, "f{}", bytes * 8),
            DataType::Pointer { space, elem } => write!(f, "{elem} {space}*"),
        }
    }
}

/// An IR value resolved by name for the debugger's `print` command
///
/// For stack allocations `ty` is the allocated type and `is_alloca` is
/// set; subscripting then loads the pointer through one extra level of
/// indirection in private memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Type of the value (allocated type for stack allocations)
    pub ty: DataType,
    /// Raw little-endian bytes of the value
    pub data: Vec<u8>,
    /// Whether this value is a stack allocation
    pub is_alloca: bool,
}

impl Value {
    /// Interpret the value bytes as an address
    #[must_use]
    pub fn as_address(&self) -> usize {
        let mut raw = [0u8; 8];
        for (slot, byte) in raw.iter_mut().zip(self.data.iter()) {
            *slot = *byte;
        }
        usize::try_from(u64::from_le_bytes(raw)).unwrap_or(usize::MAX)
    }
}

/// Mutable view of the memories a work-item may touch during one step
///
/// The ownership graph is tree-shaped (device owns global memory, each
/// group owns its local memory); the interpreter gets access per step
/// instead of holding back-references.
pub struct StepContext<'a> {
    /// The device's global memory
    pub global: &'a mut Memory,
    /// The enclosing work-group's local memory
    pub local: &'a mut Memory,
}

/// One stream of kernel execution, driven cooperatively by the scheduler
///
/// State transitions happen only inside [`WorkItem::step`]; everything
/// else is observation. Implementations report invalid accesses and
/// kernel errors through the memories / notifier they were built with and
/// reserve `Err` for fatal conditions that must abort the launch.
pub trait WorkItem {
    /// Execute one instruction; returns the state after the step
    fn step(&mut self, ctx: StepContext<'_>) -> Result<State>;

    /// Current execution state
    fn state(&self) -> State;

    /// Global id of this work-item
    fn global_id(&self) -> [usize; 3];

    /// Local id of this work-item within its work-group
    fn local_id(&self) -> [usize; 3];

    /// The instruction about to execute, if any remains
    fn current_instruction(&self) -> Option<Instruction>;

    /// Call-site instructions of the active call stack, outermost first
    fn call_stack(&self) -> Vec<Instruction>;

    /// The barrier this work-item is blocked at (`Some` iff `AtBarrier`)
    fn barrier(&self) -> Option<BarrierInfo>;

    /// Unblock from a released barrier; returns the work-item to `Ready`
    fn clear_barrier(&mut self);

    /// This work-item's private memory
    fn private_memory(&self) -> &Memory;

    /// Mutable access to the private memory
    fn private_memory_mut(&mut self) -> &mut Memory;

    /// Resolve a named IR value for the debugger
    fn variable(&self, name: &str) -> Option<Value>;

    /// Render a named variable the way the interpreter prints it
    fn format_variable(&self, name: &str) -> Option<String>;

    /// Render the function frame containing `instruction`, with argument
    /// values, e.g. `vecadd(a=0x0, n=64)`
    fn describe_function(&self, instruction: &Instruction) -> String;
}
