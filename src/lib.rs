//! # Simular
//!
//! Pure Rust OpenCL kernel simulator for correctness debugging of
//! GPU-style data-parallel programs on an ordinary CPU.
//!
//! Simular (Spanish: "to simulate") executes a compiled kernel over its
//! full NDRange with a single-threaded cooperative scheduler, which makes
//! its checking exact: every interleaving is one the simulator chose.
//!
//! ## Features
//!
//! - **NDRange execution**: work-group enumeration, cooperative
//!   work-item scheduling, collective barrier release
//! - **Memory checking**: typed, address-spaced regions with bounds
//!   validation; invalid accesses never corrupt the buffer
//! - **Race detection**: per-byte access history scoped per address
//!   space (work-items for local memory, work-groups for global)
//! - **Divergence detection**: barrier fingerprints catch work-groups
//!   whose work-items disagree about their collective operations
//! - **Interactive debugger**: breakpoints, stepping, backtraces,
//!   memory inspection and variable printing over a line-oriented prompt
//!
//! ## Example
//!
//! ```rust
//! use std::io::Cursor;
//! use std::rc::Rc;
//! use simular::testing::{AddrExpr, Payload, ScriptOp, ScriptedKernel, SharedBuffer};
//! use simular::{AddressSpace, Device, DeviceConfig};
//!
//! // every work-item stores its global id into a global buffer
//! let kernel = ScriptedKernel::builder("fill_ids")
//!     .op(ScriptOp::Store {
//!         space: AddressSpace::Global,
//!         addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
//!         payload: Payload::GlobalIdU32,
//!     })
//!     .build();
//!
//! let out = SharedBuffer::new();
//! let mut device = Device::with_io(
//!     DeviceConfig::default(),
//!     Box::new(Cursor::new(Vec::new())),
//!     Box::new(out.clone()),
//!     Box::new(SharedBuffer::new()),
//! );
//! device.global_memory_mut().allocate(16).unwrap();
//! device.run(Rc::new(kernel), 1, &[0], &[4], &[2]);
//!
//! let mut data = [0u8; 4];
//! assert!(device.global_memory().read(&mut data, 12));
//! assert_eq!(u32::from_le_bytes(data), 3);
//! ```
//!
//! ## Architecture
//!
//! The execution core is layered leaves-first: [`memory::Memory`] tracks
//! bytes and access history, [`workgroup::WorkGroup`] owns local memory
//! and schedules its work-items, and [`device::Device`] orchestrates the
//! launch and the debugger loop. The per-instruction IR interpreter and
//! the kernel loader stay outside the crate behind the
//! [`workitem::WorkItem`] and [`kernel::Kernel`] traits.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// The debugger reproduces a fixed transcript format; keep its literal
// message strings intact rather than splitting them for line length.
#![allow(clippy::too_many_lines)]

pub mod device;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod ndrange;
pub mod notify;
pub mod testing;
pub mod workgroup;
pub mod workitem;

// Re-exports for convenience
pub use device::{Device, DeviceConfig};
pub use error::{Result, SimularError};
pub use kernel::{Kernel, Program, ProgramId};
pub use memory::{Accessor, AddressSpace, Memory};
pub use ndrange::NDRange;
pub use notify::{Event, Notifier, RaceKind};
pub use workgroup::WorkGroup;
pub use workitem::{
    BarrierInfo, DataType, Instruction, SourceLocation, State, StepContext, Value, WorkItem,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
