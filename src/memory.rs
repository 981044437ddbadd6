//! Typed, address-spaced byte store with bounds and access tracking
//!
//! Each memory region is tagged with the address space it models. Local
//! and global memories additionally remember, per byte, the most recent
//! access (kind, accessor identity, instruction) since the last
//! synchronizing event; that history is what the data-race detector
//! compares against. Private memories skip tracking entirely, since no
//! race scope exists for a single owner.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimularError};
use crate::ndrange::NDRange;
use crate::notify::{Notifier, RaceKind};
use crate::workitem::Instruction;

/// Allocation bases are aligned to this many bytes
const ALLOC_ALIGN: usize = 16;

/// OpenCL address space of a memory region or pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Per-work-item memory
    Private,
    /// Per-work-group memory
    Local,
    /// Device-wide memory
    Global,
    /// Read-only memory installed before launch (stored in global memory)
    Constant,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Private => write!(f, "private"),
            AddressSpace::Local => write!(f, "local"),
            AddressSpace::Global => write!(f, "global"),
            AddressSpace::Constant => write!(f, "constant"),
        }
    }
}

/// Identity of the entity performing a tracked access
///
/// Kernel-initiated accesses carry the scalar ids of the work-item and its
/// work-group; host- and debugger-initiated accesses carry neither and are
/// exempt from race tracking.
#[derive(Debug, Clone, Default)]
pub struct Accessor {
    /// Scalar work-item id (row-major over the global size)
    pub work_item: Option<usize>,
    /// Scalar work-group id (row-major over the group counts)
    pub work_group: Option<usize>,
    /// The accessing instruction
    pub instruction: Option<Instruction>,
}

impl Accessor {
    /// An untracked accessor for host and debugger traffic
    #[must_use]
    pub fn untracked() -> Self {
        Accessor::default()
    }

    /// Accessor for a work-item identified by its geometric ids
    #[must_use]
    pub fn work_item(
        ndrange: &NDRange,
        global_id: [usize; 3],
        group_id: [usize; 3],
        instruction: Option<Instruction>,
    ) -> Self {
        Accessor {
            work_item: Some(ndrange.linear_work_item(global_id)),
            work_group: Some(ndrange.linear_work_group(group_id)),
            instruction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct AccessRecord {
    kind: AccessKind,
    work_item: Option<usize>,
    work_group: Option<usize>,
    instruction: Option<Instruction>,
}

#[derive(Debug)]
struct Allocation {
    data: Vec<u8>,
    tracking: Vec<Option<AccessRecord>>,
}

/// One address-spaced memory region
///
/// Addresses are handed out by a bump allocator with aligned bases and
/// are never reused, so a stale address stays invalid for the lifetime of
/// the region.
pub struct Memory {
    space: AddressSpace,
    notifier: Rc<Notifier>,
    allocations: BTreeMap<usize, Allocation>,
    next_address: usize,
}

impl Memory {
    /// Create an empty memory for `space`, reporting through `notifier`
    #[must_use]
    pub fn new(space: AddressSpace, notifier: Rc<Notifier>) -> Self {
        Memory {
            space,
            notifier,
            allocations: BTreeMap::new(),
            next_address: 0,
        }
    }

    /// Address space this memory models
    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        self.space
    }

    /// Allocate `size` zero-initialized bytes; returns the base address
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(SimularError::AllocationFailed { size });
        }
        let address = self.next_address;
        let next = address
            .checked_add(size)
            .and_then(|end| end.checked_add(ALLOC_ALIGN - 1))
            .map(|end| end / ALLOC_ALIGN * ALLOC_ALIGN)
            .ok_or(SimularError::AllocationFailed { size })?;
        let tracked = self.is_tracked();
        self.allocations.insert(
            address,
            Allocation {
                data: vec![0; size],
                tracking: if tracked { vec![None; size] } else { Vec::new() },
            },
        );
        self.next_address = next;
        Ok(address)
    }

    /// Release the allocation based at `address`
    pub fn deallocate(&mut self, address: usize) -> Result<()> {
        self.allocations
            .remove(&address)
            .map(|_| ())
            .ok_or(SimularError::InvalidDeallocation { address })
    }

    /// Whether `[address, address + size)` lies within one live allocation
    #[must_use]
    pub fn is_address_valid(&self, address: usize, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        match self.allocations.range(..=address).next_back() {
            Some((base, alloc)) => {
                address.checked_add(size).is_some_and(|end| end <= base + alloc.data.len())
            }
            None => false,
        }
    }

    /// Tracked load of `dst.len()` bytes starting at `address`
    ///
    /// An invalid range leaves `dst` untouched, reports an invalid-read
    /// diagnostic and returns false.
    pub fn load(&mut self, dst: &mut [u8], address: usize, accessor: &Accessor) -> bool {
        if !self.is_address_valid(address, dst.len()) {
            self.notifier.memory_error(
                true,
                self.space,
                address,
                dst.len(),
                accessor.instruction.clone(),
            );
            return false;
        }
        self.register_accesses(AccessKind::Read, address, dst.len(), accessor);
        let (base, alloc) = self.containing(address);
        let offset = address - base;
        dst.copy_from_slice(&alloc.data[offset..offset + dst.len()]);
        true
    }

    /// Tracked store of `src` starting at `address`
    ///
    /// An invalid range mutates nothing, reports an invalid-write
    /// diagnostic and returns false.
    pub fn store(&mut self, src: &[u8], address: usize, accessor: &Accessor) -> bool {
        if !self.is_address_valid(address, src.len()) {
            self.notifier.memory_error(
                false,
                self.space,
                address,
                src.len(),
                accessor.instruction.clone(),
            );
            return false;
        }
        self.register_accesses(AccessKind::Write, address, src.len(), accessor);
        let (base, alloc) = self.containing_mut(address);
        let offset = address - base;
        alloc.data[offset..offset + src.len()].copy_from_slice(src);
        true
    }

    /// Untracked inspection read used by the debugger; returns false (and
    /// reports nothing) when the range is invalid
    #[must_use]
    pub fn read(&self, dst: &mut [u8], address: usize) -> bool {
        if !self.is_address_valid(address, dst.len()) {
            return false;
        }
        let (base, alloc) = self.containing(address);
        let offset = address - base;
        dst.copy_from_slice(&alloc.data[offset..offset + dst.len()]);
        true
    }

    /// Dump every allocation, 16 bytes per row in four groups of four
    pub fn dump(&self, out: &mut dyn Write) {
        for (base, alloc) in &self.allocations {
            for (row, chunk) in alloc.data.chunks(16).enumerate() {
                let _ = write!(out, "{:>16X}:", base + row * 16);
                for (i, byte) in chunk.iter().enumerate() {
                    if i % 4 == 0 {
                        let _ = write!(out, " ");
                    }
                    let _ = write!(out, " {byte:02X}");
                }
                let _ = writeln!(out);
            }
            let _ = writeln!(out);
        }
    }

    /// Synchronizing event: publishes outstanding writes and clears the
    /// access history for this region's race scope
    pub fn synchronize(&mut self) {
        for alloc in self.allocations.values_mut() {
            for record in &mut alloc.tracking {
                *record = None;
            }
        }
    }

    fn is_tracked(&self) -> bool {
        matches!(self.space, AddressSpace::Local | AddressSpace::Global)
    }

    fn containing(&self, address: usize) -> (usize, &Allocation) {
        let (base, alloc) = self
            .allocations
            .range(..=address)
            .next_back()
            .unwrap_or_else(|| unreachable!("validated address has an allocation"));
        (*base, alloc)
    }

    fn containing_mut(&mut self, address: usize) -> (usize, &mut Allocation) {
        let (base, alloc) = self
            .allocations
            .range_mut(..=address)
            .next_back()
            .unwrap_or_else(|| unreachable!("validated address has an allocation"));
        (*base, alloc)
    }

    /// Compare `size` bytes of history against this access and record it.
    /// At most one race per conflicting entity is reported per call; after
    /// a report the record switches to the new accessor so the same pair
    /// does not re-report until another accessor intervenes.
    fn register_accesses(
        &mut self,
        kind: AccessKind,
        address: usize,
        size: usize,
        accessor: &Accessor,
    ) {
        if !self.is_tracked() {
            return;
        }
        let scope_id = match self.space {
            AddressSpace::Local => accessor.work_item,
            AddressSpace::Global => accessor.work_group,
            _ => None,
        };
        let Some(scope_id) = scope_id else {
            return; // host or debugger traffic
        };

        let space = self.space;
        let notifier = Rc::clone(&self.notifier);
        let (base, alloc) = self.containing_mut(address);
        let offset = address - base;
        let mut reported: Vec<usize> = Vec::new();

        for (i, record) in alloc.tracking[offset..offset + size].iter_mut().enumerate() {
            let new_record = AccessRecord {
                kind,
                work_item: accessor.work_item,
                work_group: accessor.work_group,
                instruction: accessor.instruction.clone(),
            };
            match record {
                None => *record = Some(new_record),
                Some(prev) => {
                    let prev_scope = match space {
                        AddressSpace::Local => prev.work_item,
                        _ => prev.work_group,
                    };
                    let conflicting = prev_scope != Some(scope_id)
                        && (kind == AccessKind::Write || prev.kind == AccessKind::Write);
                    if conflicting {
                        if let Some(other) = prev_scope {
                            if !reported.contains(&other) {
                                reported.push(other);
                                let race = if prev.kind == kind {
                                    RaceKind::WriteWrite
                                } else {
                                    RaceKind::ReadWrite
                                };
                                let (last_item, last_group) = match space {
                                    AddressSpace::Local => (prev.work_item, None),
                                    _ => (None, prev.work_group),
                                };
                                notifier.data_race(
                                    race,
                                    space,
                                    address + i,
                                    last_item,
                                    last_group,
                                    prev.instruction.clone(),
                                    accessor.instruction.clone(),
                                );
                            }
                        }
                        *record = Some(new_record);
                    } else if kind == AccessKind::Write {
                        *record = Some(new_record);
                    }
                    // a read never displaces an existing record: a
                    // same-entity write must stay visible to later readers
                }
            }
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("space", &self.space)
            .field("allocations", &self.allocations.len())
            .field("next_address", &self.next_address)
            .finish()
    }
}
