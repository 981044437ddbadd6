//! Scripted kernel fixtures for testing the execution core
//!
//! The real IR interpreter lives outside this crate, so the test suites
//! drive the device with a deliberately tiny scripted stand-in: a
//! [`ScriptedKernel`] is a flat list of operations (stores, loads,
//! cross-space copies, a local reduction, barriers) with optional per-op
//! work-item guards and source lines. That is enough to exercise every
//! scheduler path, the barrier protocol, the race detector and the
//! debugger without re-implementing an interpreter.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SimularError};
use crate::kernel::{Kernel, Program, ProgramId};
use crate::memory::{Accessor, AddressSpace, Memory};
use crate::ndrange::NDRange;
use crate::notify::Notifier;
use crate::workitem::{
    BarrierInfo, Instruction, SourceLocation, State, StepContext, Value, WorkItem,
};

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Address operand of a scripted operation, resolved per work-item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrExpr {
    /// A fixed address
    Fixed(usize),
    /// `global_id.x * scale + offset`
    GlobalIdScaled {
        /// Multiplier applied to the x global id
        scale: usize,
        /// Constant added after scaling
        offset: usize,
    },
    /// `local_id.x * scale + offset`
    LocalIdScaled {
        /// Multiplier applied to the x local id
        scale: usize,
        /// Constant added after scaling
        offset: usize,
    },
}

impl AddrExpr {
    fn resolve(&self, global_id: [usize; 3], local_id: [usize; 3]) -> usize {
        match self {
            AddrExpr::Fixed(address) => *address,
            AddrExpr::GlobalIdScaled { scale, offset } => global_id[0] * scale + offset,
            AddrExpr::LocalIdScaled { scale, offset } => local_id[0] * scale + offset,
        }
    }
}

impl fmt::Display for AddrExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrExpr::Fixed(address) => write!(f, "0x{address:X}"),
            AddrExpr::GlobalIdScaled { scale, offset } => write!(f, "gid.x*{scale}+{offset}"),
            AddrExpr::LocalIdScaled { scale, offset } => write!(f, "lid.x*{scale}+{offset}"),
        }
    }
}

/// Data written by a scripted store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Literal bytes, identical for every work-item
    Bytes(Vec<u8>),
    /// The work-item's x global id as a little-endian u32
    GlobalIdU32,
}

impl Payload {
    fn bytes(&self, global_id: [usize; 3]) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::GlobalIdU32 => u32::try_from(global_id[0])
                .unwrap_or(u32::MAX)
                .to_le_bytes()
                .to_vec(),
        }
    }
}

/// One scripted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    /// Store a payload
    Store {
        /// Target address space
        space: AddressSpace,
        /// Target address
        addr: AddrExpr,
        /// Data to write
        payload: Payload,
    },
    /// Load bytes (the value is discarded)
    Load {
        /// Source address space
        space: AddressSpace,
        /// Source address
        addr: AddrExpr,
        /// Bytes to read
        size: usize,
    },
    /// Copy bytes between address spaces
    Copy {
        /// Source address space
        from_space: AddressSpace,
        /// Source address
        from: AddrExpr,
        /// Destination address space
        to_space: AddressSpace,
        /// Destination address
        to: AddrExpr,
        /// Bytes to copy
        size: usize,
    },
    /// Sum `count` little-endian u32 values from local memory and store
    /// the u32 total to global memory
    SumLocalU32 {
        /// Base address of the local values
        base: usize,
        /// Number of u32 values
        count: usize,
        /// Global destination of the sum
        dst: AddrExpr,
    },
    /// Work-group barrier with the given memory-fence flags
    Barrier {
        /// Barrier flags
        flags: u32,
    },
    /// Do nothing
    Nop,
    /// Debug intrinsic call, excluded from instruction-count reports
    DebugMarker,
    /// Report a generic kernel error through the notifier
    Trap {
        /// Error title
        message: String,
    },
}

impl ScriptOp {
    fn opcode_name(&self) -> String {
        match self {
            ScriptOp::Store { .. } => "store".to_string(),
            ScriptOp::Load { .. } => "load".to_string(),
            ScriptOp::Copy { .. } => "copy".to_string(),
            ScriptOp::SumLocalU32 { .. } => "reduce".to_string(),
            ScriptOp::Barrier { .. } => "call barrier".to_string(),
            ScriptOp::Nop => "nop".to_string(),
            ScriptOp::DebugMarker => "call llvm.dbg.value".to_string(),
            ScriptOp::Trap { .. } => "trap".to_string(),
        }
    }

    fn text(&self) -> String {
        match self {
            ScriptOp::Store { space, addr, .. } => format!("store {space} {addr}"),
            ScriptOp::Load { space, addr, size } => format!("load {space} {addr}, {size}"),
            ScriptOp::Copy {
                from_space,
                from,
                to_space,
                to,
                size,
            } => format!("copy {from_space} {from} to {to_space} {to}, {size}"),
            ScriptOp::SumLocalU32 { base, count, .. } => {
                format!("reduce.add.u32 local 0x{base:X}, {count}")
            }
            ScriptOp::Barrier { flags } => format!("call void @barrier(i32 {flags})"),
            ScriptOp::Nop => "nop".to_string(),
            ScriptOp::DebugMarker => "call void @llvm.dbg.value()".to_string(),
            ScriptOp::Trap { message } => format!("trap \"{message}\""),
        }
    }
}

/// Restricts a scripted operation to a subset of work-items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Execute only when `local_id.x == n`
    LocalXEq(usize),
    /// Execute only when `local_id.x != n`
    LocalXNe(usize),
}

impl Guard {
    fn passes(self, local_id: [usize; 3]) -> bool {
        match self {
            Guard::LocalXEq(n) => local_id[0] == n,
            Guard::LocalXNe(n) => local_id[0] != n,
        }
    }
}

/// A scripted operation with its guard and debug line
#[derive(Debug, Clone)]
pub struct ScriptedInstruction {
    /// The operation
    pub op: ScriptOp,
    /// Source line attached as debug metadata
    pub line: Option<usize>,
    /// Optional work-item guard
    pub guard: Option<Guard>,
}

/// Program fixture: identity plus source text
#[derive(Debug, Clone)]
pub struct ScriptedProgram {
    id: ProgramId,
    source: String,
}

impl Program for ScriptedProgram {
    fn id(&self) -> ProgramId {
        self.id
    }

    fn source(&self) -> &str {
        &self.source
    }
}

struct KernelInner {
    name: String,
    program: ScriptedProgram,
    instructions: Vec<ScriptedInstruction>,
    rendered: Vec<Instruction>,
    local_buffers: Vec<usize>,
    constants: Vec<u8>,
    constant_base: Cell<Option<usize>>,
    private_alloc: usize,
    variables: HashMap<String, Value>,
    counts: RefCell<BTreeMap<String, u64>>,
}

/// Builder for [`ScriptedKernel`]
pub struct ScriptedKernelBuilder {
    name: String,
    source: String,
    source_file: String,
    program_id: Option<u64>,
    instructions: Vec<ScriptedInstruction>,
    local_buffers: Vec<usize>,
    constants: Vec<u8>,
    private_alloc: usize,
    variables: HashMap<String, Value>,
}

impl ScriptedKernelBuilder {
    /// Append an unguarded operation without debug metadata
    #[must_use]
    pub fn op(mut self, op: ScriptOp) -> Self {
        self.instructions.push(ScriptedInstruction {
            op,
            line: None,
            guard: None,
        });
        self
    }

    /// Append an unguarded operation attributed to a source line
    #[must_use]
    pub fn op_on_line(mut self, op: ScriptOp, line: usize) -> Self {
        self.instructions.push(ScriptedInstruction {
            op,
            line: Some(line),
            guard: None,
        });
        self
    }

    /// Append an operation executed only by `local_id.x == local_x`
    #[must_use]
    pub fn op_only(mut self, op: ScriptOp, local_x: usize) -> Self {
        self.instructions.push(ScriptedInstruction {
            op,
            line: None,
            guard: Some(Guard::LocalXEq(local_x)),
        });
        self
    }

    /// Append an operation skipped by `local_id.x == local_x`
    #[must_use]
    pub fn op_except(mut self, op: ScriptOp, local_x: usize) -> Self {
        self.instructions.push(ScriptedInstruction {
            op,
            line: None,
            guard: Some(Guard::LocalXNe(local_x)),
        });
        self
    }

    /// Append an operation with both a guard and a source line
    #[must_use]
    pub fn op_only_on_line(mut self, op: ScriptOp, local_x: usize, line: usize) -> Self {
        self.instructions.push(ScriptedInstruction {
            op,
            line: Some(line),
            guard: Some(Guard::LocalXEq(local_x)),
        });
        self
    }

    /// Set the program source text shown by the debugger
    #[must_use]
    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// File name reported in debug locations
    #[must_use]
    pub fn source_file(mut self, file: &str) -> Self {
        self.source_file = file.to_string();
        self
    }

    /// Force a specific program id (for breakpoint-persistence tests)
    #[must_use]
    pub fn program_id(mut self, id: u64) -> Self {
        self.program_id = Some(id);
        self
    }

    /// Declare a local-address-space buffer of `size` bytes
    #[must_use]
    pub fn local_buffer(mut self, size: usize) -> Self {
        self.local_buffers.push(size);
        self
    }

    /// Install `bytes` as a constant buffer before launch
    #[must_use]
    pub fn constants(mut self, bytes: Vec<u8>) -> Self {
        self.constants = bytes;
        self
    }

    /// Give every work-item a private allocation of `size` bytes, seeded
    /// with its x global id in the first four bytes
    #[must_use]
    pub fn private_alloc(mut self, size: usize) -> Self {
        self.private_alloc = size;
        self
    }

    /// Expose a named variable to the debugger's `print` command
    #[must_use]
    pub fn variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    /// Finish the kernel
    #[must_use]
    pub fn build(self) -> ScriptedKernel {
        let program = ScriptedProgram {
            id: ProgramId(
                self.program_id
                    .unwrap_or_else(|| NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)),
            ),
            source: self.source,
        };
        let rendered = self
            .instructions
            .iter()
            .enumerate()
            .map(|(index, scripted)| Instruction {
                id: index as u64,
                text: scripted.op.text(),
                function: self.name.clone(),
                location: scripted.line.map(|line| SourceLocation {
                    line,
                    file: self.source_file.clone(),
                }),
            })
            .collect();
        ScriptedKernel {
            inner: Rc::new(KernelInner {
                name: self.name,
                program,
                instructions: self.instructions,
                rendered,
                local_buffers: self.local_buffers,
                constants: self.constants,
                constant_base: Cell::new(None),
                private_alloc: self.private_alloc,
                variables: self.variables,
                counts: RefCell::new(BTreeMap::new()),
            }),
        }
    }
}

/// Kernel fixture executing a fixed operation script per work-item
pub struct ScriptedKernel {
    inner: Rc<KernelInner>,
}

impl ScriptedKernel {
    /// Start building a kernel named `name`
    #[must_use]
    pub fn builder(name: &str) -> ScriptedKernelBuilder {
        ScriptedKernelBuilder {
            name: name.to_string(),
            source: String::new(),
            source_file: "kernel.cl".to_string(),
            program_id: None,
            instructions: Vec::new(),
            local_buffers: Vec::new(),
            constants: Vec::new(),
            private_alloc: 0,
            variables: HashMap::new(),
        }
    }

    /// Address of the installed constant buffer, if any
    #[must_use]
    pub fn constant_base(&self) -> Option<usize> {
        self.inner.constant_base.get()
    }
}

impl Kernel for ScriptedKernel {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn program(&self) -> &dyn Program {
        &self.inner.program
    }

    fn allocate_constants(&self, memory: &mut Memory) -> Result<()> {
        if self.inner.constants.is_empty() {
            return Ok(());
        }
        let base = memory.allocate(self.inner.constants.len())?;
        memory.store(&self.inner.constants, base, &Accessor::untracked());
        self.inner.constant_base.set(Some(base));
        Ok(())
    }

    fn deallocate_constants(&self, memory: &mut Memory) {
        if let Some(base) = self.inner.constant_base.take() {
            let _ = memory.deallocate(base);
        }
    }

    fn local_buffer_sizes(&self) -> Vec<usize> {
        self.inner.local_buffers.clone()
    }

    fn create_work_item(
        &self,
        ndrange: NDRange,
        global_id: [usize; 3],
        local_id: [usize; 3],
        notifier: Rc<Notifier>,
    ) -> Box<dyn WorkItem> {
        let mut private = Memory::new(AddressSpace::Private, Rc::clone(&notifier));
        if self.inner.private_alloc > 0 {
            if let Ok(base) = private.allocate(self.inner.private_alloc) {
                let seed = u32::try_from(global_id[0]).unwrap_or(u32::MAX).to_le_bytes();
                private.store(&seed, base, &Accessor::untracked());
            }
        }
        let group_id = [
            (global_id[0] - ndrange.global_offset[0]) / ndrange.local_size[0],
            (global_id[1] - ndrange.global_offset[1]) / ndrange.local_size[1],
            (global_id[2] - ndrange.global_offset[2]) / ndrange.local_size[2],
        ];
        Box::new(ScriptedWorkItem {
            inner: Rc::clone(&self.inner),
            ndrange,
            global_id,
            local_id,
            group_id,
            pc: 0,
            state: State::Ready,
            barrier_info: None,
            private,
            notifier,
        })
    }

    fn clear_instruction_counts(&self) {
        self.inner.counts.borrow_mut().clear();
    }

    fn instruction_counts(&self) -> Vec<(String, u64)> {
        self.inner
            .counts
            .borrow()
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect()
    }
}

/// Work-item fixture interpreting its kernel's script
pub struct ScriptedWorkItem {
    inner: Rc<KernelInner>,
    ndrange: NDRange,
    global_id: [usize; 3],
    local_id: [usize; 3],
    group_id: [usize; 3],
    pc: usize,
    state: State,
    barrier_info: Option<BarrierInfo>,
    private: Memory,
    notifier: Rc<Notifier>,
}

impl ScriptedWorkItem {
    fn execute(&mut self, op: &ScriptOp, instruction: Instruction, ctx: &mut StepContext<'_>) {
        let accessor = Accessor::work_item(
            &self.ndrange,
            self.global_id,
            self.group_id,
            Some(instruction.clone()),
        );
        match op {
            ScriptOp::Store { space, addr, payload } => {
                let bytes = payload.bytes(self.global_id);
                let address = addr.resolve(self.global_id, self.local_id);
                self.memory_for(*space, ctx).store(&bytes, address, &accessor);
            }
            ScriptOp::Load { space, addr, size } => {
                let mut buf = vec![0u8; *size];
                let address = addr.resolve(self.global_id, self.local_id);
                self.memory_for(*space, ctx).load(&mut buf, address, &accessor);
            }
            ScriptOp::Copy {
                from_space,
                from,
                to_space,
                to,
                size,
            } => {
                let mut buf = vec![0u8; *size];
                let src = from.resolve(self.global_id, self.local_id);
                if self.memory_for(*from_space, ctx).load(&mut buf, src, &accessor) {
                    let dst = to.resolve(self.global_id, self.local_id);
                    self.memory_for(*to_space, ctx).store(&buf, dst, &accessor);
                }
            }
            ScriptOp::SumLocalU32 { base, count, dst } => {
                let mut sum = 0u32;
                for i in 0..*count {
                    let mut buf = [0u8; 4];
                    if ctx.local.load(&mut buf, base + i * 4, &accessor) {
                        sum = sum.wrapping_add(u32::from_le_bytes(buf));
                    }
                }
                let address = dst.resolve(self.global_id, self.local_id);
                ctx.global.store(&sum.to_le_bytes(), address, &accessor);
            }
            ScriptOp::Barrier { flags } => {
                self.state = State::AtBarrier;
                self.barrier_info = Some(BarrierInfo {
                    instruction,
                    flags: *flags,
                });
            }
            ScriptOp::Trap { message } => {
                self.notifier.error(message, "");
            }
            ScriptOp::Nop | ScriptOp::DebugMarker => {}
        }
    }

    fn memory_for<'m>(
        &'m mut self,
        space: AddressSpace,
        ctx: &'m mut StepContext<'_>,
    ) -> &'m mut Memory {
        match space {
            AddressSpace::Global | AddressSpace::Constant => ctx.global,
            AddressSpace::Local => ctx.local,
            AddressSpace::Private => &mut self.private,
        }
    }
}

impl WorkItem for ScriptedWorkItem {
    fn step(&mut self, mut ctx: StepContext<'_>) -> Result<State> {
        if self.state != State::Ready {
            return Ok(self.state);
        }
        if self.pc >= self.inner.instructions.len() {
            self.state = State::Finished;
            return Ok(self.state);
        }

        let scripted = self.inner.instructions[self.pc].clone();
        let executes = scripted.guard.map_or(true, |guard| guard.passes(self.local_id));
        if executes {
            let instruction = self.inner.rendered[self.pc].clone();
            *self
                .inner
                .counts
                .borrow_mut()
                .entry(scripted.op.opcode_name())
                .or_insert(0) += 1;
            self.execute(&scripted.op, instruction, &mut ctx);
        }

        self.pc += 1;
        if self.state == State::Ready && self.pc >= self.inner.instructions.len() {
            self.state = State::Finished;
        }
        Ok(self.state)
    }

    fn state(&self) -> State {
        self.state
    }

    fn global_id(&self) -> [usize; 3] {
        self.global_id
    }

    fn local_id(&self) -> [usize; 3] {
        self.local_id
    }

    fn current_instruction(&self) -> Option<Instruction> {
        match self.state {
            State::AtBarrier => self
                .barrier_info
                .as_ref()
                .map(|barrier| barrier.instruction.clone()),
            _ => self.inner.rendered.get(self.pc).cloned(),
        }
    }

    fn call_stack(&self) -> Vec<Instruction> {
        Vec::new()
    }

    fn barrier(&self) -> Option<BarrierInfo> {
        self.barrier_info.clone()
    }

    fn clear_barrier(&mut self) {
        self.state = State::Ready;
        self.barrier_info = None;
    }

    fn private_memory(&self) -> &Memory {
        &self.private
    }

    fn private_memory_mut(&mut self) -> &mut Memory {
        &mut self.private
    }

    fn variable(&self, name: &str) -> Option<Value> {
        self.inner.variables.get(name).cloned()
    }

    fn format_variable(&self, name: &str) -> Option<String> {
        let value = self.inner.variables.get(name)?;
        Some(value.ty.format_data(&value.data))
    }

    fn describe_function(&self, _instruction: &Instruction) -> String {
        format!("{}()", self.inner.name)
    }
}

/// Kernel fixture whose constant allocation raises a fatal error
pub struct FailingKernel {
    program: ScriptedProgram,
}

impl FailingKernel {
    /// Create the fixture
    #[must_use]
    pub fn new() -> Self {
        FailingKernel {
            program: ScriptedProgram {
                id: ProgramId(NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed)),
                source: String::new(),
            },
        }
    }
}

impl Default for FailingKernel {
    fn default() -> Self {
        FailingKernel::new()
    }
}

impl Kernel for FailingKernel {
    fn name(&self) -> &str {
        "broken"
    }

    fn program(&self) -> &dyn Program {
        &self.program
    }

    fn allocate_constants(&self, _memory: &mut Memory) -> Result<()> {
        Err(SimularError::fatal(
            "Kernel.rs",
            101,
            "Failed to allocate constant buffer",
        ))
    }

    fn deallocate_constants(&self, _memory: &mut Memory) {}

    fn create_work_item(
        &self,
        _ndrange: NDRange,
        global_id: [usize; 3],
        local_id: [usize; 3],
        notifier: Rc<Notifier>,
    ) -> Box<dyn WorkItem> {
        Box::new(ScriptedWorkItem {
            inner: ScriptedKernel::builder("broken").build().inner,
            ndrange: NDRange::default(),
            global_id,
            local_id,
            group_id: [0; 3],
            pc: 0,
            state: State::Ready,
            barrier_info: None,
            private: Memory::new(AddressSpace::Private, Rc::clone(&notifier)),
            notifier,
        })
    }

    fn clear_instruction_counts(&self) {}

    fn instruction_counts(&self) -> Vec<(String, u64)> {
        Vec::new()
    }
}

/// Cloneable in-memory writer for capturing debugger transcripts
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        SharedBuffer::default()
    }

    /// Everything written so far, lossily decoded as UTF-8
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_to_end(item: &mut dyn WorkItem, global: &mut Memory, local: &mut Memory) {
        while item.state() == State::Ready {
            item.step(StepContext {
                global: &mut *global,
                local: &mut *local,
            })
            .unwrap();
        }
    }

    #[test]
    fn test_scripted_work_item_runs_to_finished() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .op(ScriptOp::Nop)
            .op(ScriptOp::Nop)
            .build();
        let mut item =
            kernel.create_work_item(NDRange::default(), [0; 3], [0; 3], Rc::clone(&notifier));
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        let mut local = Memory::new(AddressSpace::Local, Rc::clone(&notifier));
        step_to_end(item.as_mut(), &mut global, &mut local);
        assert_eq!(item.state(), State::Finished);
        assert_eq!(item.current_instruction(), None);
        assert_eq!(kernel.instruction_counts(), vec![("nop".to_string(), 2)]);
    }

    #[test]
    fn test_store_writes_global_memory() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .op(ScriptOp::Store {
                space: AddressSpace::Global,
                addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
                payload: Payload::GlobalIdU32,
            })
            .build();
        let ndrange = NDRange::new(1, &[0], &[2], &[2]);
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        let mut local = Memory::new(AddressSpace::Local, Rc::clone(&notifier));
        global.allocate(8).unwrap();
        for x in 0..2 {
            let mut item =
                kernel.create_work_item(ndrange, [x, 0, 0], [x, 0, 0], Rc::clone(&notifier));
            step_to_end(item.as_mut(), &mut global, &mut local);
        }
        let mut buf = [0u8; 8];
        assert!(global.read(&mut buf, 0));
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn test_barrier_blocks_until_cleared() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .op(ScriptOp::Barrier { flags: 1 })
            .op(ScriptOp::Nop)
            .build();
        let mut item =
            kernel.create_work_item(NDRange::default(), [0; 3], [0; 3], Rc::clone(&notifier));
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        let mut local = Memory::new(AddressSpace::Local, Rc::clone(&notifier));
        let state = item
            .step(StepContext { global: &mut global, local: &mut local })
            .unwrap();
        assert_eq!(state, State::AtBarrier);
        let barrier = item.barrier().expect("barrier info");
        assert_eq!(barrier.flags, 1);
        item.clear_barrier();
        assert_eq!(item.state(), State::Ready);
        step_to_end(item.as_mut(), &mut global, &mut local);
        assert_eq!(item.state(), State::Finished);
    }

    #[test]
    fn test_guard_skips_without_counting() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .op_only(ScriptOp::Nop, 0)
            .build();
        let mut item =
            kernel.create_work_item(NDRange::default(), [1, 0, 0], [1, 0, 0], Rc::clone(&notifier));
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        let mut local = Memory::new(AddressSpace::Local, Rc::clone(&notifier));
        step_to_end(item.as_mut(), &mut global, &mut local);
        assert!(kernel.instruction_counts().is_empty());
    }

    #[test]
    fn test_constants_install_and_remove() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .constants(vec![1, 2, 3, 4])
            .op(ScriptOp::Nop)
            .build();
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        kernel.allocate_constants(&mut global).unwrap();
        let base = kernel.constant_base().expect("constants installed");
        let mut buf = [0u8; 4];
        assert!(global.read(&mut buf, base));
        assert_eq!(buf, [1, 2, 3, 4]);
        kernel.deallocate_constants(&mut global);
        assert!(!global.is_address_valid(base, 1));
    }

    #[test]
    fn test_failing_kernel_reports_fatal() {
        let notifier = Rc::new(Notifier::new());
        let kernel = FailingKernel::new();
        let mut global = Memory::new(AddressSpace::Global, Rc::clone(&notifier));
        match kernel.allocate_constants(&mut global) {
            Err(SimularError::Fatal { file, line, .. }) => {
                assert_eq!(file, "Kernel.rs");
                assert_eq!(line, 101);
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_buffer_captures_writes() {
        let buffer = SharedBuffer::new();
        let mut clone = buffer.clone();
        writeln!(clone, "hello").unwrap();
        assert_eq!(buffer.contents(), "hello\n");
    }

    #[test]
    fn test_private_alloc_seeded_with_global_id() {
        let notifier = Rc::new(Notifier::new());
        let kernel = ScriptedKernel::builder("k")
            .private_alloc(16)
            .op(ScriptOp::Nop)
            .build();
        let ndrange = NDRange::new(1, &[0], &[8], &[2]);
        let item = kernel.create_work_item(ndrange, [5, 0, 0], [1, 0, 0], notifier);
        let mut buf = [0u8; 4];
        assert!(item.private_memory().read(&mut buf, 0));
        assert_eq!(u32::from_le_bytes(buf), 5);
    }
}
