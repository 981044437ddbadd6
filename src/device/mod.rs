//! NDRange execution engine
//!
//! The device owns one launch at a time: it enumerates work-groups into a
//! pending pool, rotates instantiated groups through a running pool,
//! steps the current work-item cooperatively, renders the diagnostics its
//! collaborators queue on the shared notifier, and (when interactive)
//! drives the line-oriented debugger in [`debugger`].
//!
//! Scheduling is single-threaded and cooperative: work-items yield only
//! at instruction boundaries and barriers, which is what makes the race
//! detector exact.

mod debugger;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimularError};
use crate::kernel::{Kernel, ProgramId};
use crate::memory::{AddressSpace, Memory};
use crate::ndrange::NDRange;
use crate::notify::{Event, Notifier};
use crate::workgroup::WorkGroup;
use crate::workitem::{Instruction, State, WorkItem};

/// Number of source lines printed by the debugger's `list` command
pub(crate) const LIST_LENGTH: usize = 10;

macro_rules! out {
    ($device:expr, $($arg:tt)*) => {{
        let _ = write!($device.out, $($arg)*);
    }};
}

macro_rules! outln {
    ($device:expr) => {{
        let _ = writeln!($device.out);
    }};
    ($device:expr, $($arg:tt)*) => {{
        let _ = writeln!($device.out, $($arg)*);
    }};
}

macro_rules! errln {
    ($device:expr) => {{
        let _ = writeln!($device.err);
    }};
    ($device:expr, $($arg:tt)*) => {{
        let _ = writeln!($device.err, $($arg)*);
    }};
}

pub(crate) use errln;
pub(crate) use out;
pub(crate) use outln;

/// Launch-time toggles, read from the environment by default
///
/// The variable names are a fixed external contract: each toggle is
/// active when its variable equals `"1"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `OCLGRIND_INTERACTIVE`: enter the debugger prompt on launch
    pub interactive: bool,
    /// `OCLGRIND_INST_COUNTS`: emit an instruction histogram after launch
    pub inst_counts: bool,
    /// `OCLGRIND_QUICK`: enumerate only the first and last work-groups
    pub quick: bool,
}

impl DeviceConfig {
    /// Read the toggles from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        fn flag(name: &str) -> bool {
            std::env::var(name).map(|value| value == "1").unwrap_or(false)
        }
        DeviceConfig {
            interactive: flag("OCLGRIND_INTERACTIVE"),
            inst_counts: flag("OCLGRIND_INST_COUNTS"),
            quick: flag("OCLGRIND_QUICK"),
        }
    }
}

/// Per-launch execution engine
///
/// One kernel invocation runs at a time. Global memory and the breakpoint
/// table outlive individual launches; everything else is per-launch
/// state, released on every exit path.
pub struct Device {
    config: DeviceConfig,
    notifier: Rc<Notifier>,
    global_memory: Memory,
    kernel: Option<Rc<dyn Kernel>>,
    program_id: Option<ProgramId>,
    ndrange: NDRange,
    pending_groups: VecDeque<[usize; 3]>,
    running_groups: VecDeque<WorkGroup>,
    current_group: Option<WorkGroup>,
    current_item: Option<usize>,
    breakpoints: HashMap<ProgramId, BTreeMap<usize, usize>>,
    next_breakpoint: usize,
    source_lines: Vec<String>,
    list_position: usize,
    last_break_line: usize,
    interactive: bool,
    running: bool,
    input: Box<dyn BufRead>,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Device {
    /// Create a device configured from the environment, attached to the
    /// process's standard streams
    #[must_use]
    pub fn new() -> Self {
        Device::with_io(
            DeviceConfig::from_env(),
            Box::new(BufReader::new(std::io::stdin())),
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        )
    }

    /// Create a device with explicit configuration and I/O sinks
    #[must_use]
    pub fn with_io(
        config: DeviceConfig,
        input: Box<dyn BufRead>,
        out: Box<dyn Write>,
        err: Box<dyn Write>,
    ) -> Self {
        let notifier = Rc::new(Notifier::new());
        Device {
            config,
            global_memory: Memory::new(AddressSpace::Global, Rc::clone(&notifier)),
            notifier,
            kernel: None,
            program_id: None,
            ndrange: NDRange::default(),
            pending_groups: VecDeque::new(),
            running_groups: VecDeque::new(),
            current_group: None,
            current_item: None,
            breakpoints: HashMap::new(),
            next_breakpoint: 1,
            source_lines: Vec::new(),
            list_position: 0,
            last_break_line: 0,
            interactive: config.interactive,
            running: false,
            input,
            out,
            err,
        }
    }

    /// Launch configuration in effect
    #[must_use]
    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    /// Whether the debugger prompt is active for launches
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// The device's global memory
    #[must_use]
    pub fn global_memory(&self) -> &Memory {
        &self.global_memory
    }

    /// Mutable access to the global memory (host-side buffer setup)
    pub fn global_memory_mut(&mut self) -> &mut Memory {
        &mut self.global_memory
    }

    /// The current work-group, if a launch is in flight
    #[must_use]
    pub fn current_work_group(&self) -> Option<&WorkGroup> {
        self.current_group.as_ref()
    }

    /// The current work-item, if a launch is in flight
    #[must_use]
    pub fn current_work_item(&self) -> Option<&dyn WorkItem> {
        let index = self.current_item?;
        Some(self.current_group.as_ref()?.item(index))
    }

    /// Number of work-groups parked in the running pool
    #[must_use]
    pub fn running_pool_len(&self) -> usize {
        self.running_groups.len()
    }

    /// Whether a notification requested a break since the last continue
    #[must_use]
    pub fn force_break(&self) -> bool {
        self.notifier.force_break()
    }

    /// Source line of the current work-item's next instruction, or 0
    #[must_use]
    pub fn current_line_number(&self) -> usize {
        match self.current_work_item() {
            Some(item) if item.state() != State::Finished => item
                .current_instruction()
                .map_or(0, |instruction| instruction.line()),
            _ => 0,
        }
    }

    /// Run one kernel invocation to completion
    ///
    /// This is the single entry point for a launch. Interactive devices
    /// enter the debugger prompt; otherwise the NDRange executes to
    /// completion. All owned launch state is released on every exit path,
    /// including a fatal error.
    pub fn run(
        &mut self,
        kernel: Rc<dyn Kernel>,
        work_dim: usize,
        global_offset: &[usize],
        global_size: &[usize],
        local_size: &[usize],
    ) {
        assert!(self.running_groups.is_empty(), "a launch is already in flight");
        self.ndrange = NDRange::new(work_dim, global_offset, global_size, local_size);

        if let Err(error) = kernel.allocate_constants(&mut self.global_memory) {
            self.print_fatal(&error);
            errln!(
                self,
                "When allocating kernel constants for '{}'",
                kernel.name()
            );
            return;
        }

        let num_groups = self.ndrange.num_groups();
        self.pending_groups.clear();
        if self.config.quick {
            // only the origin and far-corner groups run in quick mode
            let first = [0, 0, 0];
            let last = [num_groups[0] - 1, num_groups[1] - 1, num_groups[2] - 1];
            self.pending_groups.push_back(first);
            if last != first {
                self.pending_groups.push_back(last);
            }
        } else {
            for k in 0..num_groups[2] {
                for j in 0..num_groups[1] {
                    for i in 0..num_groups[0] {
                        self.pending_groups.push_back([i, j, k]);
                    }
                }
            }
        }

        kernel.clear_instruction_counts();
        self.program_id = Some(kernel.program().id());
        self.kernel = Some(Rc::clone(&kernel));
        self.list_position = 0;
        self.current_group = None;
        self.current_item = None;
        self.global_memory.synchronize();

        if let Err(error) = self.launch_loop() {
            self.print_fatal(&error);
            let context = self.error_context();
            let _ = write!(self.err, "{context}");
            errln!(self);
        }

        // release everything the launch owns, on every exit path
        self.running_groups.clear();
        self.current_group = None;
        self.current_item = None;
        self.pending_groups.clear();
        kernel.deallocate_constants(&mut self.global_memory);
        self.kernel = None;
        self.program_id = None;

        self.global_memory.synchronize();

        if self.config.inst_counts {
            self.report_instruction_counts(kernel.as_ref());
        }
    }

    /// Rotate the current work-item selection
    ///
    /// Pops the next ready work-item from the current group, releasing a
    /// complete barrier when the ready queue drains; an exhausted group is
    /// destroyed and the running then pending pools are consulted for the
    /// next group. Returns false when the launch is complete.
    pub fn next_work_item(&mut self) -> Result<bool> {
        self.current_item = None;
        if let Some(group) = self.current_group.as_mut() {
            // switch to the next ready work-item
            if let Some(index) = group.next_work_item() {
                self.current_item = Some(index);
                return Ok(true);
            }

            // no ready work-items; resume a complete barrier
            if group.has_barrier() {
                group.clear_barrier();
                self.current_item = group.next_work_item();
                return Ok(true);
            }

            // all work-items finished (or blocked divergent): destroy
            self.current_group = None;
        }

        if let Some(group) = self.running_groups.pop_front() {
            self.current_group = Some(group);
        } else if let Some(coords) = self.pending_groups.pop_front() {
            let group = self.create_work_group(coords)?;
            self.current_group = Some(group);
        } else {
            return Ok(false);
        }

        self.current_item = self
            .current_group
            .as_mut()
            .and_then(WorkGroup::next_work_item);

        // the group may have already run dry under the debugger
        if self.current_item.is_none() {
            return self.next_work_item();
        }

        Ok(true)
    }

    pub(crate) fn create_work_group(&self, group_id: [usize; 3]) -> Result<WorkGroup> {
        let kernel = self.kernel.as_ref().ok_or_else(|| {
            SimularError::fatal(file!(), line!(), "no kernel bound to the device")
        })?;
        WorkGroup::new(
            kernel.as_ref(),
            self.ndrange,
            group_id,
            Rc::clone(&self.notifier),
        )
    }

    /// Step the current work-item by one instruction and render any
    /// diagnostics it produced
    pub(crate) fn step_instruction(&mut self) -> Result<()> {
        let result = match (self.current_group.as_mut(), self.current_item) {
            (Some(group), Some(index)) => {
                group.step_item(index, &mut self.global_memory).map(|_| ())
            }
            _ => Ok(()),
        };
        self.flush_notifications();
        result
    }

    /// Step one whole source line (one instruction without source)
    pub(crate) fn step_line(&mut self) -> Result<()> {
        match self.current_state() {
            Some(State::AtBarrier) => {
                outln!(self, "Work-item is at a barrier.");
                return Ok(());
            }
            Some(State::Finished) => {
                outln!(self, "Work-item has finished execution.");
                return Ok(());
            }
            Some(State::Ready) => {}
            None => return Ok(()),
        }

        let prev_line = self.current_line_number();
        loop {
            self.step_instruction()?;
            if self.current_state() != Some(State::Ready) {
                break;
            }
            let line = self.current_line_number();
            if self.source_lines.is_empty() || (line != prev_line && line != 0) {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn current_state(&self) -> Option<State> {
        self.current_work_item().map(WorkItem::state)
    }

    fn launch_loop(&mut self) -> Result<()> {
        self.next_work_item()?;

        if self.interactive {
            self.running = true;

            // split the program source for the debugger, if available
            let source = self
                .kernel
                .as_ref()
                .map(|kernel| kernel.program().source().to_string())
                .unwrap_or_default();
            self.source_lines = source.lines().map(str::to_string).collect();

            outln!(self);
            self.cmd_info(&[]);
        } else {
            self.cmd_continue()?;
            self.running = false;
        }

        while self.running {
            out!(self, "(oclgrind) ");
            let _ = self.out.flush();

            let mut line = String::new();
            let read = self.input.read_line(&mut line).unwrap_or(0);
            if read == 0 {
                outln!(self, "(quit)");
                self.cmd_quit();
                break;
            }

            let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if tokens.is_empty() {
                continue;
            }

            self.dispatch(&tokens)?;
        }
        Ok(())
    }

    pub(crate) fn flush_notifications(&mut self) {
        for event in self.notifier.drain() {
            self.render_event(&event);
        }
    }

    fn render_event(&mut self, event: &Event) {
        match event {
            Event::MemoryError {
                read,
                space,
                address,
                size,
                instruction,
            } => {
                let context = self.error_context_at(instruction.as_ref());
                errln!(self);
                errln!(
                    self,
                    "Invalid {} of size {size} at {space} memory address {address:x}",
                    if *read { "read" } else { "write" }
                );
                let _ = write!(self.err, "{context}");
                errln!(self);
            }
            Event::DataRace {
                kind,
                space,
                address,
                last_work_item,
                last_work_group,
                instruction,
                current_instruction,
            } => {
                let context = self.error_context_at(current_instruction.as_ref());
                errln!(self);
                errln!(self, "{kind} data race at {space} memory address {address:x}");
                let _ = write!(self.err, "{context}");
                errln!(self);
                if let Some(id) = last_work_item {
                    let [x, y, z] = self.ndrange.work_item_from_linear(*id);
                    errln!(self, "\tRace occured with work-item ({x},{y},{z})");
                } else if let Some(id) = last_work_group {
                    let [x, y, z] = self.ndrange.work_group_from_linear(*id);
                    errln!(self, "\tRace occured with work-group ({x},{y},{z})");
                } else {
                    errln!(self, "\tRace occured with unknown entity");
                }
                if let Some(instruction) = instruction {
                    let _ = write!(self.err, "\t{}", format_instruction(instruction));
                }
                errln!(self);
            }
            Event::Divergence {
                kind,
                current_info,
                previous_info,
                instruction,
            } => {
                let context = self.error_context();
                errln!(self);
                errln!(self, "Work-group divergence detected ({kind}):");
                let _ = write!(self.err, "{context}");
                if !current_info.is_empty() {
                    errln!(self, "\t{current_info}");
                }
                errln!(self);
                errln!(self, "Previous work-items executed this instruction:");
                if let Some(instruction) = instruction {
                    let _ = write!(self.err, "\t{}", format_instruction(instruction));
                }
                if !previous_info.is_empty() {
                    errln!(self, "\t{previous_info}");
                }
                errln!(self);
            }
            Event::KernelError { message, info } => {
                let context = self.error_context();
                errln!(self);
                errln!(self, "{message}:");
                let _ = write!(self.err, "{context}");
                if !info.is_empty() {
                    errln!(self, "\t{info}");
                }
                errln!(self);
            }
        }
    }

    /// Context block attached to every diagnostic: current work-item,
    /// work-group, kernel and instruction, each line tab-prefixed
    pub(crate) fn error_context(&self) -> String {
        self.error_context_at(None)
    }

    /// Context block with the instruction line pinned to `instruction`
    /// when given; events raised mid-access carry the faulting
    /// instruction, which the post-step scheduler state no longer shows
    fn error_context_at(&self, instruction: Option<&Instruction>) -> String {
        let mut text = String::new();
        if let Some(item) = self.current_work_item() {
            let g = item.global_id();
            let l = item.local_id();
            let _ = writeln!(
                text,
                "\tWork-item:  Global({},{},{}) Local({},{},{})",
                g[0], g[1], g[2], l[0], l[1], l[2]
            );
        }
        if let Some(group) = self.current_group.as_ref() {
            let id = group.group_id();
            let _ = writeln!(text, "\tWork-group: ({},{},{})", id[0], id[1], id[2]);
        }
        if let Some(kernel) = &self.kernel {
            let _ = writeln!(text, "\tKernel:     {}", kernel.name());
        }
        let instruction = instruction.cloned().or_else(|| {
            self.current_work_item()
                .and_then(WorkItem::current_instruction)
        });
        if let Some(instruction) = instruction {
            text.push('\t');
            text.push_str(&format_instruction(&instruction));
        }
        text
    }

    fn print_fatal(&mut self, error: &SimularError) {
        errln!(self);
        if let SimularError::Fatal { file, line, message } = error {
            errln!(self, "OCLGRIND FATAL ERROR ({file}:{line})");
            errln!(self, "{message}");
        } else {
            errln!(self, "OCLGRIND FATAL ERROR");
            errln!(self, "{error}");
        }
    }

    pub(crate) fn print_current_line(&mut self) {
        let Some(item) = self.current_work_item() else {
            return;
        };
        if item.state() == State::Finished {
            return;
        }
        let instruction = item.current_instruction();
        let line = self.current_line_number();
        if !self.source_lines.is_empty() && line > 0 {
            self.print_source_line(line);
        } else {
            outln!(self, "Source line not available.");
            if let Some(instruction) = instruction {
                outln!(self, "{}", instruction.text);
            }
        }
    }

    pub(crate) fn print_source_line(&mut self, line: usize) {
        if line >= 1 && line <= self.source_lines.len() {
            outln!(self, "{line}\t{}", self.source_lines[line - 1]);
        } else {
            outln!(self, "Invalid line number: {line}");
        }
    }

    fn report_instruction_counts(&mut self, kernel: &dyn Kernel) {
        outln!(self, "Instructions executed for kernel '{}':", kernel.name());
        let mut counts: Vec<(String, u64)> = kernel
            .instruction_counts()
            .into_iter()
            .filter(|(name, count)| *count > 0 && !name.starts_with("call llvm.dbg."))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        for (name, count) in counts {
            outln!(self, "{:>16} - {name}", format_count(count));
        }
        outln!(self);
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::new()
    }
}

/// Render an instruction dump plus its debug location, both terminated
/// with newlines, for embedding in tab-prefixed diagnostic blocks
pub(crate) fn format_instruction(instruction: &Instruction) -> String {
    let mut text = format!("{}\n\t", instruction.text);
    match &instruction.location {
        Some(location) => {
            let _ = writeln!(text, "At line {} of {}", location.line, location.file);
        }
        None => text.push_str("Debugging information not available.\n"),
    }
    text
}

/// Format a count with locale-style thousands grouping
pub(crate) fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workitem::SourceLocation;
    use serial_test::serial;

    #[test]
    fn test_format_count_groups_thousands() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn test_format_instruction_with_location() {
        let instruction = Instruction {
            id: 3,
            text: "store global 0x0".to_string(),
            function: "k".to_string(),
            location: Some(SourceLocation {
                line: 12,
                file: "kernel.cl".to_string(),
            }),
        };
        assert_eq!(
            format_instruction(&instruction),
            "store global 0x0\n\tAt line 12 of kernel.cl\n"
        );
    }

    #[test]
    fn test_format_instruction_without_location() {
        let instruction = Instruction {
            id: 0,
            text: "nop".to_string(),
            function: "k".to_string(),
            location: None,
        };
        assert_eq!(
            format_instruction(&instruction),
            "nop\n\tDebugging information not available.\n"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_all_set() {
        std::env::set_var("OCLGRIND_INTERACTIVE", "1");
        std::env::set_var("OCLGRIND_INST_COUNTS", "1");
        std::env::set_var("OCLGRIND_QUICK", "1");
        let config = DeviceConfig::from_env();
        assert!(config.interactive);
        assert!(config.inst_counts);
        assert!(config.quick);
        std::env::remove_var("OCLGRIND_INTERACTIVE");
        std::env::remove_var("OCLGRIND_INST_COUNTS");
        std::env::remove_var("OCLGRIND_QUICK");
    }

    #[test]
    #[serial]
    fn test_config_from_env_requires_exact_one() {
        std::env::set_var("OCLGRIND_QUICK", "true");
        let config = DeviceConfig::from_env();
        assert!(!config.quick);
        std::env::remove_var("OCLGRIND_QUICK");
        let config = DeviceConfig::from_env();
        assert!(!config.quick);
    }
}
