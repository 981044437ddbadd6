//! Interactive debugger commands
//!
//! One handler per command, dispatched on the first whitespace token of a
//! prompt line. Every command has a long and a short alias; message
//! strings are part of the transcript contract and are reproduced
//! exactly.

use std::io::Write;

use super::{out, outln, Device, LIST_LENGTH};
use crate::error::Result;
use crate::memory::{AddressSpace, Memory};
use crate::workitem::{DataType, State};

/// Result of rendering one `print` operand
enum PrintOutcome {
    /// Text to print; processing continues with the next operand
    Text(String),
    /// Error that aborts the whole command
    Stop(String),
}

impl Device {
    /// Dispatch one tokenized command line
    pub(crate) fn dispatch(&mut self, tokens: &[String]) -> Result<()> {
        match tokens[0].as_str() {
            "backtrace" | "bt" => self.cmd_backtrace(),
            "break" | "b" => self.cmd_break(tokens),
            "continue" | "c" => self.cmd_continue()?,
            "delete" | "d" => self.cmd_delete(tokens),
            "gmem" | "gm" | "lmem" | "lm" | "pmem" | "pm" => self.cmd_memory(tokens),
            "help" | "h" => self.cmd_help(tokens),
            "info" | "i" => self.cmd_info(tokens),
            "list" | "l" => self.cmd_list(tokens),
            "next" | "n" => self.cmd_next()?,
            "print" | "p" => self.cmd_print(tokens),
            "quit" | "q" => self.cmd_quit(),
            "step" | "s" => self.cmd_step()?,
            "workitem" | "wi" => self.cmd_workitem(tokens)?,
            other => outln!(self, "Unrecognized command '{other}'"),
        }
        Ok(())
    }

    pub(crate) fn cmd_backtrace(&mut self) {
        let frames: Vec<(usize, String, usize)> = {
            let Some(item) = self.current_work_item() else {
                return;
            };
            if item.state() == State::Finished {
                return;
            }
            let stack = item.call_stack();
            let mut frames = Vec::with_capacity(stack.len() + 1);
            if let Some(instruction) = item.current_instruction() {
                frames.push((
                    stack.len(),
                    item.describe_function(&instruction),
                    instruction.line(),
                ));
            }
            for (depth, call_site) in stack.iter().enumerate().rev() {
                frames.push((depth, item.describe_function(call_site), call_site.line()));
            }
            frames
        };
        for (depth, description, line) in frames {
            outln!(self, "#{depth} {description} at line {line}");
        }
    }

    pub(crate) fn cmd_break(&mut self, tokens: &[String]) {
        if self.source_lines.is_empty() {
            outln!(self, "Breakpoints only valid when source is available.");
            return;
        }

        let mut line = self.current_line_number();
        if tokens.len() > 1 {
            match tokens[1].parse::<usize>() {
                Ok(parsed) if parsed > 0 && parsed <= self.source_lines.len() + 1 => line = parsed,
                _ => {
                    outln!(self, "Invalid line number.");
                    return;
                }
            }
        }

        if line > 0 {
            if let Some(program) = self.program_id {
                let id = self.next_breakpoint;
                self.next_breakpoint += 1;
                self.breakpoints.entry(program).or_default().insert(id, line);
            }
        } else {
            outln!(self, "Not currently on a line.");
        }
    }

    /// Resume execution until a breakpoint, a notification or completion
    pub(crate) fn cmd_continue(&mut self) -> Result<()> {
        let mut can_break = false;
        self.notifier.clear_force_break();
        self.running = true;

        while self.current_item.is_some() && self.running {
            // run the current work-item as far as possible
            while self.current_state() == Some(State::Ready) && self.running {
                self.step_instruction()?;

                if !self.interactive {
                    continue;
                }

                if self.notifier.force_break() {
                    self.list_position = 0;
                    self.notifier.clear_force_break();
                    return Ok(());
                }

                if self.breakpoints.is_empty() {
                    continue;
                }

                let line = self.current_line_number();
                if !can_break {
                    // skip until we have passed over the previous break line
                    if line == self.last_break_line {
                        continue;
                    }
                    can_break = true;
                }

                let hit = self
                    .program_id
                    .and_then(|program| self.breakpoints.get(&program))
                    .and_then(|table| {
                        table
                            .iter()
                            .find(|(_, &breakpoint)| breakpoint == line)
                            .map(|(&id, _)| id)
                    });
                if let Some(id) = hit {
                    let gid = self
                        .current_work_item()
                        .map(|item| item.global_id())
                        .unwrap_or_default();
                    outln!(
                        self,
                        "Breakpoint {id} hit at line {line} by work-item ({},{},{})",
                        gid[0],
                        gid[1],
                        gid[2]
                    );
                    self.print_current_line();
                    self.last_break_line = line;
                    self.list_position = 0;
                    return Ok(());
                }
            }

            self.next_work_item()?;
        }
        self.running = false;
        Ok(())
    }

    pub(crate) fn cmd_delete(&mut self, tokens: &[String]) {
        if tokens.len() > 1 {
            let Ok(id) = tokens[1].parse::<usize>() else {
                outln!(self, "Invalid breakpoint number.");
                return;
            };
            let removed = self
                .program_id
                .and_then(|program| self.breakpoints.get_mut(&program))
                .is_some_and(|table| table.remove(&id).is_some());
            if !removed {
                outln!(self, "Breakpoint not found.");
            }
        } else {
            out!(self, "Delete all breakpoints? (y/n) ");
            let _ = self.out.flush();
            let mut confirm = String::new();
            let _ = self.input.read_line(&mut confirm);
            if confirm.trim() == "y" {
                self.breakpoints.clear();
            }
        }
    }

    pub(crate) fn cmd_memory(&mut self, tokens: &[String]) {
        let selector = tokens[0].chars().next().unwrap_or('g');
        if (selector == 'l' || selector == 'p') && self.current_work_item().is_none() {
            outln!(self, "All work-items finished.");
            return;
        }

        // dump the whole region when no address is given
        if tokens.len() == 1 {
            match selector {
                'l' => {
                    if let Some(group) = self.current_group.as_ref() {
                        group.local_memory().dump(&mut self.out);
                    }
                }
                'p' => {
                    if let (Some(group), Some(index)) =
                        (self.current_group.as_ref(), self.current_item)
                    {
                        group.item(index).private_memory().dump(&mut self.out);
                    }
                }
                _ => self.global_memory.dump(&mut self.out),
            }
            return;
        }
        if tokens.len() > 3 {
            outln!(self, "Invalid number of arguments.");
            return;
        }

        let address = match parse_hex(&tokens[1]) {
            Some(address) if address % 4 == 0 => address,
            _ => {
                outln!(self, "Invalid address.");
                return;
            }
        };

        let mut size = 8usize;
        if tokens.len() == 3 {
            match tokens[2].parse::<usize>() {
                Ok(parsed) if parsed > 0 => size = parsed,
                _ => {
                    outln!(self, "Invalid size");
                    return;
                }
            }
        }

        let data: Option<Vec<u8>> = {
            let memory: Option<&Memory> = match selector {
                'l' => self.current_group.as_ref().map(|group| group.local_memory()),
                'p' => match (self.current_group.as_ref(), self.current_item) {
                    (Some(group), Some(index)) => Some(group.item(index).private_memory()),
                    _ => None,
                },
                _ => Some(&self.global_memory),
            };
            memory.and_then(|memory| {
                if memory.is_address_valid(address, size) {
                    let mut buf = vec![0u8; size];
                    memory.read(&mut buf, address).then_some(buf)
                } else {
                    None
                }
            })
        };

        let Some(data) = data else {
            outln!(self, "Invalid memory address.");
            return;
        };

        for (i, byte) in data.iter().enumerate() {
            if i % 4 == 0 {
                outln!(self);
                out!(self, "{:>16X}:", address + i);
            }
            out!(self, " {byte:02X}");
        }
        outln!(self);
        outln!(self);
    }

    pub(crate) fn cmd_help(&mut self, tokens: &[String]) {
        if tokens.len() < 2 {
            outln!(self, "Command list:");
            outln!(self, "  backtrace    (bt)");
            outln!(self, "  break        (b)");
            outln!(self, "  continue     (c)");
            outln!(self, "  delete       (d)");
            outln!(self, "  gmem         (gm)");
            outln!(self, "  help         (h)");
            outln!(self, "  info         (i)");
            outln!(self, "  list         (l)");
            outln!(self, "  next         (n)");
            outln!(self, "  lmem         (lm)");
            outln!(self, "  pmem         (pm)");
            outln!(self, "  print        (p)");
            outln!(self, "  quit         (q)");
            outln!(self, "  step         (s)");
            outln!(self, "  workitem     (wi)");
            outln!(self, "(type 'help command' for more information)");
            return;
        }

        match tokens[1].as_str() {
            "backtrace" | "bt" => outln!(self, "Print function call stack."),
            "break" | "b" => {
                outln!(self, "Set a breakpoint (only functional when source is available).");
                outln!(self, "With no arguments, sets a breakpoint at the current line.");
                outln!(self, "Use a numeric argument to set a breakpoint at a specific line.");
            }
            "continue" | "c" => outln!(self, "Continue kernel execution until next breakpoint."),
            "delete" | "d" => {
                outln!(self, "Delete a breakpoint.");
                outln!(self, "With no arguments, deletes all breakpoints.");
            }
            "help" | "h" => outln!(self, "Display usage information for a command."),
            "info" | "i" => {
                outln!(self, "Display information about current debugging context.");
                outln!(self, "With no arguments, displays general information.");
                outln!(self, "'info break' lists breakpoints.");
            }
            "list" | "l" => {
                outln!(self, "List source lines.");
                outln!(
                    self,
                    "With no argument, lists {LIST_LENGTH} lines after previous listing."
                );
                outln!(
                    self,
                    "Use - to list {LIST_LENGTH} lines before the previous listing"
                );
                outln!(self, "Use a numeric argument to list around a specific line number.");
            }
            "gmem" | "gm" | "lmem" | "lm" | "pmem" | "pm" => {
                let space = match tokens[1].chars().next() {
                    Some('l') => "local",
                    Some('p') => "private",
                    _ => "global",
                };
                outln!(self, "Examine contents of {space} memory.");
                outln!(self, "With no arguments, dumps entire contents of memory.");
                outln!(self, "'{} address [size]'", tokens[1]);
                outln!(self, "address is hexadecimal and 4-byte aligned.");
            }
            "next" | "n" => {
                outln!(self, "Step forward, treating function calls as single instruction.");
            }
            "print" | "p" => outln!(self, "Print the values of one or more variables."),
            "quit" | "q" => {
                outln!(
                    self,
                    "Quit interactive debugger (and terminate current kernel invocation)."
                );
            }
            "step" | "s" => {
                outln!(
                    self,
                    "Step forward a single source line, or an instruction if no source available."
                );
            }
            "workitem" | "wi" => {
                outln!(self, "Switch to a different work-item.");
                outln!(
                    self,
                    "Up to three (space separated) arguments allowed, specifying the global ID of the work-item."
                );
            }
            other => outln!(self, "Unrecognized command '{other}'"),
        }
    }

    pub(crate) fn cmd_info(&mut self, tokens: &[String]) {
        if tokens.len() > 1 {
            if tokens[1] == "break" {
                let entries: Vec<(usize, usize)> = self
                    .program_id
                    .and_then(|program| self.breakpoints.get(&program))
                    .map(|table| table.iter().map(|(&id, &line)| (id, line)).collect())
                    .unwrap_or_default();
                for (id, line) in entries {
                    outln!(self, "Breakpoint {id}: Line {line}");
                }
            } else {
                outln!(self, "Invalid info command: {}", tokens[1]);
            }
            return;
        }

        let name = self
            .kernel
            .as_ref()
            .map(|kernel| kernel.name().to_string())
            .unwrap_or_default();
        let range = self.ndrange;
        outln!(self, "Running kernel '{name}'");
        outln!(
            self,
            "-> Global work size:   ({},{},{})",
            range.global_size[0],
            range.global_size[1],
            range.global_size[2]
        );
        outln!(
            self,
            "-> Global work offset: ({},{},{})",
            range.global_offset[0],
            range.global_offset[1],
            range.global_offset[2]
        );
        outln!(
            self,
            "-> Local work size:    ({},{},{})",
            range.local_size[0],
            range.local_size[1],
            range.local_size[2]
        );

        if let Some(gid) = self.current_work_item().map(|item| item.global_id()) {
            outln!(self);
            outln!(self, "Current work-item: ({},{},{})", gid[0], gid[1], gid[2]);
            self.print_current_line();
        } else {
            outln!(self, "All work-items finished.");
        }
    }

    pub(crate) fn cmd_list(&mut self, tokens: &[String]) {
        if self.current_item.is_none() {
            outln!(self, "All work-items finished.");
            return;
        }
        if self.source_lines.is_empty() {
            outln!(self, "No source code available.");
            return;
        }

        let mut start = 0usize;
        let mut forwards = true;
        if tokens.len() > 1 {
            if tokens[1] == "-" {
                forwards = false;
            } else {
                match tokens[1].parse::<usize>() {
                    Ok(center) => {
                        start = if center > LIST_LENGTH / 2 {
                            center - LIST_LENGTH / 2
                        } else {
                            1
                        };
                    }
                    Err(_) => {
                        outln!(self, "Invalid line number.");
                        return;
                    }
                }
            }
        }

        if start == 0 {
            if forwards {
                // continue from the previous listing
                start = if self.list_position > 0 {
                    self.list_position + LIST_LENGTH
                } else {
                    self.current_line_number() + 1
                };
                if start >= self.source_lines.len() + 1 {
                    self.list_position = self.source_lines.len() + 1;
                    return;
                }
            } else {
                start = if self.list_position > 0 {
                    self.list_position
                } else {
                    self.current_line_number()
                };
                start = if start > LIST_LENGTH { start - LIST_LENGTH } else { 1 };
            }
        }

        for i in 0..LIST_LENGTH {
            if start + i >= self.source_lines.len() + 1 {
                break;
            }
            self.print_source_line(start + i);
        }
        self.list_position = start;
    }

    pub(crate) fn cmd_next(&mut self) -> Result<()> {
        if self.current_item.is_none() {
            outln!(self, "All work-items finished.");
            return Ok(());
        }

        // step until we return to the same call depth
        let prev_depth = self
            .current_work_item()
            .map_or(0, |item| item.call_stack().len());
        loop {
            self.step_line()?;
            let depth = self
                .current_work_item()
                .map_or(0, |item| item.call_stack().len());
            if depth <= prev_depth {
                break;
            }
        }

        self.print_frame_change(prev_depth);
        self.print_current_line();
        self.list_position = 0;
        Ok(())
    }

    pub(crate) fn cmd_print(&mut self, tokens: &[String]) {
        if tokens.len() < 2 {
            outln!(self, "Variable name(s) required.");
            return;
        }
        for operand in &tokens[1..] {
            out!(self, "{operand} = ");
            match self.render_variable(operand) {
                PrintOutcome::Text(text) => outln!(self, "{text}"),
                PrintOutcome::Stop(message) => {
                    outln!(self, "{message}");
                    return;
                }
            }
        }
    }

    pub(crate) fn cmd_quit(&mut self) {
        self.interactive = false;
        self.running = false;
        self.breakpoints.clear();
    }

    pub(crate) fn cmd_step(&mut self) -> Result<()> {
        if self.current_item.is_none() {
            outln!(self, "All work-items finished.");
            return Ok(());
        }

        let prev_depth = self
            .current_work_item()
            .map_or(0, |item| item.call_stack().len());

        self.step_line()?;

        self.print_frame_change(prev_depth);
        self.print_current_line();
        self.list_position = 0;
        Ok(())
    }

    pub(crate) fn cmd_workitem(&mut self, tokens: &[String]) -> Result<()> {
        let mut gid = [0usize; 3];
        for (i, token) in tokens.iter().skip(1).take(3).enumerate() {
            match token.parse::<usize>() {
                Ok(value) if value < self.ndrange.global_size[i] => gid[i] = value,
                _ => {
                    outln!(self, "Invalid global ID.");
                    return Ok(());
                }
            }
        }
        let group = self.ndrange.group_of(gid);

        // locate the owning work-group: current group, then the running
        // pool, then the pending pool (instantiated on demand)
        let in_current = self
            .current_group
            .as_ref()
            .is_some_and(|current| current.group_id() == group);
        let mut target = None;
        if !in_current {
            if let Some(pos) = self
                .running_groups
                .iter()
                .position(|candidate| candidate.group_id() == group)
            {
                target = self.running_groups.remove(pos);
            } else if let Some(pos) = self
                .pending_groups
                .iter()
                .position(|&coords| coords == group)
            {
                self.pending_groups.remove(pos);
                target = Some(self.create_work_group(group)?);
            }
        }
        if !in_current && target.is_none() {
            outln!(self, "Work-item has already finished, unable to load state.");
            return Ok(());
        }

        // a still-ready displaced current work-item goes back to its queue
        if let (Some(current), Some(index)) = (self.current_group.as_mut(), self.current_item) {
            current.requeue(index);
        }

        if let Some(new_group) = target {
            if let Some(previous) = self.current_group.take() {
                self.running_groups.push_back(previous);
            }
            self.current_group = Some(new_group);
        }

        let index = self
            .current_group
            .as_ref()
            .map_or(0, |g| g.item_index(self.ndrange.local_of(gid)));
        if let Some(group) = self.current_group.as_mut() {
            group.checkout(index);
        }
        self.current_item = Some(index);

        outln!(self, "Switched to work-item: ({},{},{})", gid[0], gid[1], gid[2]);
        if self.current_state() == Some(State::Finished) {
            outln!(self, "Work-item has finished execution.");
        } else {
            self.print_current_line();
        }
        Ok(())
    }

    fn print_frame_change(&mut self, prev_depth: usize) {
        let frame = self.current_work_item().and_then(|item| {
            if item.state() == State::Finished || item.call_stack().len() == prev_depth {
                return None;
            }
            item.current_instruction()
                .map(|instruction| (item.describe_function(&instruction), instruction.line()))
        });
        if let Some((description, line)) = frame {
            outln!(self, "{description} at line {line}");
        }
    }

    fn render_variable(&self, operand: &str) -> PrintOutcome {
        let Some(open) = operand.find('[') else {
            let text = self
                .current_work_item()
                .and_then(|item| item.format_variable(operand));
            return PrintOutcome::Text(text.unwrap_or_else(|| "not found".to_string()));
        };

        let Some(close) = operand.find(']') else {
            return PrintOutcome::Stop("missing ']'".to_string());
        };
        if close != operand.len() - 1 {
            return PrintOutcome::Stop("invalid variable".to_string());
        }
        let Ok(index) = operand[open + 1..close].parse::<usize>() else {
            return PrintOutcome::Stop("invalid index".to_string());
        };

        let Some(item) = self.current_work_item() else {
            return PrintOutcome::Stop("not found".to_string());
        };
        let Some(value) = item.variable(&operand[..open]) else {
            return PrintOutcome::Stop("not found".to_string());
        };

        let DataType::Pointer { space, elem } = value.ty.clone() else {
            return PrintOutcome::Stop("not a pointer".to_string());
        };

        let mut base = value.as_address();
        if value.is_alloca {
            // the alloca slot holds the pointer; load it first
            let mut slot = [0u8; 8];
            if !item.private_memory().read(&mut slot, base) {
                return PrintOutcome::Text("invalid memory address".to_string());
            }
            base = usize::try_from(u64::from_le_bytes(slot)).unwrap_or(usize::MAX);
        }

        let elem_size = elem.size();
        let Some(address) = index
            .checked_mul(elem_size)
            .and_then(|offset| base.checked_add(offset))
        else {
            return PrintOutcome::Text("invalid memory address".to_string());
        };

        let memory: Option<&Memory> = match space {
            AddressSpace::Private => Some(item.private_memory()),
            AddressSpace::Global | AddressSpace::Constant => Some(&self.global_memory),
            AddressSpace::Local => self.current_group.as_ref().map(|g| g.local_memory()),
        };
        let Some(memory) = memory else {
            return PrintOutcome::Text("invalid memory address".to_string());
        };

        if !memory.is_address_valid(address, elem_size) {
            return PrintOutcome::Text("invalid memory address".to_string());
        }
        let mut data = vec![0u8; elem_size];
        let _ = memory.read(&mut data, address);
        PrintOutcome::Text(elem.format_data(&data))
    }
}

/// Parse a hexadecimal address with optional `0x` prefix
fn parse_hex(token: &str) -> Option<usize> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    usize::from_str_radix(digits, 16).ok()
}
