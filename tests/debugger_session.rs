//! Interactive debugger transcript tests
//!
//! Feeds scripted command sequences through the prompt loop and asserts
//! on the captured transcript. The message strings and dump formats are a
//! fixed contract, so several tests compare output bit-exactly.

use std::io::Cursor;
use std::rc::Rc;

use simular::testing::{AddrExpr, Payload, ScriptOp, ScriptedKernel, SharedBuffer};
use simular::{Accessor, AddressSpace, DataType, Device, DeviceConfig, Kernel, Value};

const SOURCE: &str = "__kernel void vecadd(__global int *a) {\n  int i = get_global_id(0);\n  a[i] = a[i] + 1;\n  a[i] = a[i] * 2;\n}";

/// Build an interactive device fed by `commands`
fn debug_device(commands: &str) -> (Device, SharedBuffer, SharedBuffer) {
    let out = SharedBuffer::new();
    let err = SharedBuffer::new();
    let config = DeviceConfig {
        interactive: true,
        ..DeviceConfig::default()
    };
    let device = Device::with_io(
        config,
        Box::new(Cursor::new(commands.as_bytes().to_vec())),
        Box::new(out.clone()),
        Box::new(err.clone()),
    );
    (device, out, err)
}

/// Four-instruction kernel with source, debug lines and variables
fn vecadd_kernel() -> ScriptedKernel {
    ScriptedKernel::builder("vecadd")
        .source(SOURCE)
        .private_alloc(16)
        .variable(
            "x",
            Value {
                ty: DataType::Int { bytes: 4, signed: true },
                data: 42i32.to_le_bytes().to_vec(),
                is_alloca: false,
            },
        )
        .variable(
            "data",
            Value {
                ty: DataType::Pointer {
                    space: AddressSpace::Global,
                    elem: Box::new(DataType::Int { bytes: 4, signed: true }),
                },
                data: 0u64.to_le_bytes().to_vec(),
                is_alloca: false,
            },
        )
        .variable(
            "buf",
            Value {
                ty: DataType::Pointer {
                    space: AddressSpace::Private,
                    elem: Box::new(DataType::Int { bytes: 4, signed: true }),
                },
                data: 0u64.to_le_bytes().to_vec(),
                is_alloca: true,
            },
        )
        .op_on_line(ScriptOp::Nop, 2)
        .op_on_line(
            ScriptOp::Load {
                space: AddressSpace::Global,
                addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
                size: 4,
            },
            3,
        )
        .op_on_line(
            ScriptOp::Store {
                space: AddressSpace::Global,
                addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
                payload: Payload::Bytes(vec![1, 0, 0, 0]),
            },
            3,
        )
        .op_on_line(
            ScriptOp::Store {
                space: AddressSpace::Global,
                addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
                payload: Payload::Bytes(vec![2, 0, 0, 0]),
            },
            4,
        )
        .build()
}

/// Seed the host-visible global buffer with four i32 values
fn seed_globals(device: &mut Device) {
    device.global_memory_mut().allocate(16).unwrap();
    let values: Vec<u8> = [10u32, 20, 30, 40]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    device
        .global_memory_mut()
        .store(&values, 0, &Accessor::untracked());
}

fn run_vecadd(commands: &str) -> (SharedBuffer, SharedBuffer) {
    let (mut device, out, err) = debug_device(commands);
    seed_globals(&mut device);
    device.run(Rc::new(vecadd_kernel()), 1, &[0], &[4], &[2]);
    (out, err)
}

fn prompt_count(text: &str) -> usize {
    text.matches("(oclgrind) ").count()
}

// ============================================================================
// Startup, prompt and quit
// ============================================================================

#[test]
fn test_sourceless_session_transcript_is_exact() {
    let (mut device, out, err) = debug_device("q\n");
    let kernel = ScriptedKernel::builder("k").op(ScriptOp::Nop).build();
    device.run(Rc::new(kernel), 1, &[0], &[1], &[1]);

    let expected = "\nRunning kernel 'k'\n-> Global work size:   (1,1,1)\n-> Global work offset: (0,0,0)\n-> Local work size:    (1,1,1)\n\nCurrent work-item: (0,0,0)\nSource line not available.\nnop\n(oclgrind) ";
    assert_eq!(out.contents(), expected);
    assert_eq!(err.contents(), "");
}

#[test]
fn test_eof_prints_quit_marker() {
    let (out, _err) = run_vecadd("");
    let text = out.contents();
    assert!(text.ends_with("(oclgrind) (quit)\n"), "transcript:\n{text}");
}

#[test]
fn test_empty_lines_are_ignored() {
    let (out, _err) = run_vecadd("\n\nq\n");
    let text = out.contents();
    assert_eq!(prompt_count(&text), 3);
    assert!(!text.contains("Unrecognized"));
}

#[test]
fn test_unknown_command_diagnostic() {
    let (out, _err) = run_vecadd("frobnicate\nq\n");
    assert!(out.contents().contains("Unrecognized command 'frobnicate'"));
}

#[test]
fn test_startup_info_shows_geometry_and_line() {
    let (out, _err) = run_vecadd("q\n");
    let text = out.contents();
    assert!(text.contains("Running kernel 'vecadd'"));
    assert!(text.contains("-> Global work size:   (4,1,1)"));
    assert!(text.contains("-> Local work size:    (2,1,1)"));
    assert!(text.contains("Current work-item: (0,0,0)"));
    assert!(text.contains("2\t  int i = get_global_id(0);"));
}

// ============================================================================
// Breakpoints
// ============================================================================

#[test]
fn test_breakpoint_session() {
    // the distilled end-to-end debugger scenario
    let (out, _err) = run_vecadd("b 3\nc\nbt\np x\nq\n");
    let text = out.contents();
    assert!(
        text.contains("Breakpoint 1 hit at line 3 by work-item (0,0,0)"),
        "transcript:\n{text}"
    );
    assert!(text.contains("3\t  a[i] = a[i] + 1;"));
    assert!(text.contains("#0 vecadd() at line 3"));
    assert!(text.contains("x = 42"));
}

#[test]
fn test_breakpoint_ids_are_monotonic_and_listed() {
    let (out, _err) = run_vecadd("b 3\nb 4\ni break\nq\n");
    let text = out.contents();
    assert!(text.contains("Breakpoint 1: Line 3"));
    assert!(text.contains("Breakpoint 2: Line 4"));
}

#[test]
fn test_delete_single_breakpoint() {
    let (out, _err) = run_vecadd("b 3\nb 4\nd 1\ni break\nq\n");
    let text = out.contents();
    assert!(!text.contains("Breakpoint 1: Line 3"));
    assert!(text.contains("Breakpoint 2: Line 4"));
}

#[test]
fn test_delete_all_breakpoints_prompts_for_confirmation() {
    let (out, _err) = run_vecadd("b 3\nd\ny\ni break\nq\n");
    let text = out.contents();
    assert!(text.contains("Delete all breakpoints? (y/n) "));
    assert!(!text.contains("Breakpoint 1"));
}

#[test]
fn test_delete_all_aborted_keeps_breakpoints() {
    let (out, _err) = run_vecadd("b 3\nd\nn\ni break\nq\n");
    assert!(out.contents().contains("Breakpoint 1: Line 3"));
}

#[test]
fn test_breakpoint_validation() {
    let (out, _err) = run_vecadd("b abc\nb 99\nb 0\nd abc\nd 9\nq\n");
    let text = out.contents();
    assert_eq!(text.matches("Invalid line number.").count(), 3);
    assert!(text.contains("Invalid breakpoint number."));
    assert!(text.contains("Breakpoint not found."));
}

#[test]
fn test_break_without_source_is_rejected() {
    let (mut device, out, _err) = debug_device("b 3\nq\n");
    let kernel = ScriptedKernel::builder("k").op(ScriptOp::Nop).build();
    device.run(Rc::new(kernel), 1, &[0], &[1], &[1]);
    assert!(out
        .contents()
        .contains("Breakpoints only valid when source is available."));
}

#[test]
fn test_continue_does_not_rebreak_on_same_line() {
    // two instructions share line 3; the second continue must advance to
    // the next work-item rather than re-hitting line 3 immediately
    let (out, _err) = run_vecadd("b 3\nc\nc\nq\n");
    let text = out.contents();
    assert!(text.contains("Breakpoint 1 hit at line 3 by work-item (0,0,0)"));
    assert!(text.contains("Breakpoint 1 hit at line 3 by work-item (1,0,0)"));
}

#[test]
fn test_breakpoints_persist_across_launches_of_same_program() {
    // the first launch sets a breakpoint at line 4 and runs to
    // completion (one hit per work-item); the trailing commands are
    // consumed by the second launch of the same program
    let commands = "b 4\nc\nc\nc\nc\nc\ni break\nq\n";
    let (mut device, out, _err) = debug_device(commands);
    seed_globals(&mut device);
    let kernel: Rc<dyn Kernel> = Rc::new(vecadd_kernel());
    device.run(Rc::clone(&kernel), 1, &[0], &[4], &[2]);
    device.run(Rc::clone(&kernel), 1, &[0], &[4], &[2]);

    let text = out.contents();
    assert!(
        text.contains("Breakpoint 1: Line 4"),
        "breakpoints must survive launches:\n{text}"
    );
}

// ============================================================================
// Stepping
// ============================================================================

#[test]
fn test_step_advances_one_source_line() {
    let (out, _err) = run_vecadd("s\nq\n");
    assert!(out.contents().contains("3\t  a[i] = a[i] + 1;"));
}

#[test]
fn test_step_past_finish_reports_state() {
    // three source-line steps finish the work-item; the fourth reports it
    let (out, _err) = run_vecadd("s\ns\ns\ns\nq\n");
    assert!(out.contents().contains("Work-item has finished execution."));
}

#[test]
fn test_next_behaves_like_step_without_calls() {
    let (out, _err) = run_vecadd("n\nq\n");
    assert!(out.contents().contains("3\t  a[i] = a[i] + 1;"));
}

// ============================================================================
// Memory inspection
// ============================================================================

#[test]
fn test_gmem_inspect_format_is_exact() {
    let (out, _err) = run_vecadd("gm 0 8\nq\n");
    let text = out.contents();
    assert!(
        text.contains("\n               0: 0A 00 00 00\n               4: 14 00 00 00\n\n"),
        "transcript:\n{text}"
    );
}

#[test]
fn test_gmem_inspect_roundtrips_memory_contents() {
    let (mut device, out, _err) = debug_device("gm 0 16\nq\n");
    seed_globals(&mut device);
    device.run(Rc::new(vecadd_kernel()), 1, &[0], &[4], &[2]);

    // parse the dumped bytes back out of the transcript
    let text = out.contents();
    let mut parsed = Vec::new();
    for line in text.lines() {
        if let Some((_, bytes)) = line.split_once(": ") {
            if line.trim_start().starts_with(|c: char| c.is_ascii_hexdigit()) {
                for pair in bytes.split_whitespace() {
                    if let Ok(byte) = u8::from_str_radix(pair, 16) {
                        parsed.push(byte);
                    }
                }
            }
        }
    }
    let mut expected = vec![0u8; 16];
    assert!(device.global_memory().read(&mut expected, 0));
    assert_eq!(parsed, expected);
}

#[test]
fn test_memory_command_validation() {
    let (out, _err) = run_vecadd("gm 5\ngm zz\ngm 0 0\ngm 100\ngm 0 4 4\nq\n");
    let text = out.contents();
    assert_eq!(text.matches("Invalid address.").count(), 2);
    assert!(text.contains("Invalid size"));
    assert!(text.contains("Invalid memory address."));
    assert!(text.contains("Invalid number of arguments."));
}

#[test]
fn test_lmem_dump_shows_local_buffer() {
    let (mut device, out, _err) = debug_device("lm\nq\n");
    let kernel = ScriptedKernel::builder("k")
        .local_buffer(8)
        .op(ScriptOp::Nop)
        .build();
    device.run(Rc::new(kernel), 1, &[0], &[1], &[1]);
    assert!(out
        .contents()
        .contains("               0:  00 00 00 00  00 00 00 00"));
}

#[test]
fn test_pmem_inspect_reads_private_memory() {
    let (out, _err) = run_vecadd("wi 1\npm 0 4\nq\n");
    let text = out.contents();
    assert!(text.contains("Switched to work-item: (1,0,0)"));
    assert!(text.contains("\n               0: 01 00 00 00\n\n"));
}

// ============================================================================
// Source listing
// ============================================================================

#[test]
fn test_list_centering_continuation_and_backwards() {
    let source: Vec<String> = (1..=25).map(|n| format!("line {n}")).collect();
    let source = source.join("\n");
    let (mut device, out, _err) = debug_device("l 12\nl\nl\nl -\nl abc\nq\n");
    let kernel = ScriptedKernel::builder("k")
        .source(&source)
        .op_on_line(ScriptOp::Nop, 1)
        .build();
    device.run(Rc::new(kernel), 1, &[0], &[1], &[1]);

    let text = out.contents();
    // `l 12` centers: lines 7-16
    assert!(text.contains("7\tline 7"));
    assert!(text.contains("16\tline 16"));
    // `l` continues: lines 17-25
    assert!(text.contains("17\tline 17"));
    assert!(text.contains("25\tline 25"));
    // third `l` is past the end and prints nothing; `l -` backs up to 16-25
    assert_eq!(text.matches("16\tline 16").count(), 2);
    assert!(text.contains("Invalid line number."));
}

// ============================================================================
// Variable printing
// ============================================================================

#[test]
fn test_print_plain_variable_and_not_found() {
    let (out, _err) = run_vecadd("p x\np missing\nq\n");
    let text = out.contents();
    assert!(text.contains("x = 42"));
    assert!(text.contains("missing = not found"));
}

#[test]
fn test_print_requires_argument() {
    let (out, _err) = run_vecadd("p\nq\n");
    assert!(out.contents().contains("Variable name(s) required."));
}

#[test]
fn test_print_subscripted_global_pointer() {
    let (out, _err) = run_vecadd("p data[2]\nq\n");
    assert!(out.contents().contains("data[2] = 30"));
}

#[test]
fn test_print_subscript_through_alloca_indirection() {
    let (out, _err) = run_vecadd("p buf[0]\nq\n");
    assert!(out.contents().contains("buf[0] = 0"));
}

#[test]
fn test_print_subscript_errors() {
    let (out, _err) = run_vecadd("p data[1\nq\n");
    assert!(out.contents().contains("missing ']'"));
    let (out, _err) = run_vecadd("p data[zz]\nq\n");
    assert!(out.contents().contains("invalid index"));
    let (out, _err) = run_vecadd("p x[0]\nq\n");
    assert!(out.contents().contains("x[0] = not a pointer"));
    let (out, _err) = run_vecadd("p data[99]\nq\n");
    assert!(out.contents().contains("data[99] = invalid memory address"));
}

// ============================================================================
// Work-item switching
// ============================================================================

#[test]
fn test_workitem_switch_within_and_across_groups() {
    let (out, _err) = run_vecadd("wi 1\nwi 2\nq\n");
    let text = out.contents();
    // same group first, then group 1 instantiated from the pending pool
    assert!(text.contains("Switched to work-item: (1,0,0)"));
    assert!(text.contains("Switched to work-item: (2,0,0)"));
}

#[test]
fn test_workitem_rejects_out_of_range_ids() {
    let (out, _err) = run_vecadd("wi 9\nwi 1 1\nq\n");
    assert_eq!(out.contents().matches("Invalid global ID.").count(), 2);
}

#[test]
fn test_workitem_already_finished_group() {
    // gids 2 and 3 read out of bounds, forcing a break after group 0 has
    // already retired; switching back to it must fail cleanly
    let (mut device, out, err) = debug_device("c\nwi 0\nq\n");
    device.global_memory_mut().allocate(8).unwrap();
    let kernel = ScriptedKernel::builder("oob")
        .op(ScriptOp::Load {
            space: AddressSpace::Global,
            addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
            size: 4,
        })
        .build();
    device.run(Rc::new(kernel), 1, &[0], &[4], &[2]);

    assert!(err.contents().contains("Invalid read of size 4"));
    assert!(out
        .contents()
        .contains("Work-item has already finished, unable to load state."));
}

// ============================================================================
// Help
// ============================================================================

#[test]
fn test_help_lists_commands() {
    let (out, _err) = run_vecadd("h\nq\n");
    let text = out.contents();
    assert!(text.contains("Command list:"));
    assert!(text.contains("  backtrace    (bt)"));
    assert!(text.contains("  workitem     (wi)"));
    assert!(text.contains("(type 'help command' for more information)"));
}

#[test]
fn test_help_for_specific_commands() {
    let (out, _err) = run_vecadd("h break\nh lmem\nh bogus\nq\n");
    let text = out.contents();
    assert!(text.contains("Set a breakpoint (only functional when source is available)."));
    assert!(text.contains("Examine contents of local memory."));
    assert!(text.contains("Unrecognized command 'bogus'"));
}

// ============================================================================
// Notifications at the prompt
// ============================================================================

#[test]
fn test_notification_returns_to_prompt_during_continue() {
    let (mut device, out, err) = debug_device("c\nc\nq\n");
    device.global_memory_mut().allocate(4).unwrap();
    // the second work-item reads out of bounds
    let kernel = ScriptedKernel::builder("k")
        .op(ScriptOp::Load {
            space: AddressSpace::Global,
            addr: AddrExpr::GlobalIdScaled { scale: 4, offset: 0 },
            size: 4,
        })
        .op(ScriptOp::Nop)
        .build();
    device.run(Rc::new(kernel), 1, &[0], &[2], &[2]);

    assert!(err.contents().contains("Invalid read of size 4"));
    // the first continue returned to the prompt after the diagnostic;
    // the second ran the launch to completion and ended the session
    assert_eq!(prompt_count(&out.contents()), 2);
}
