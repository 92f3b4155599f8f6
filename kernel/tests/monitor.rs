mod common;

use common::*;
use exokernel::arch::interrupts::{T_BRKPT, T_PGFLT};
use exokernel::{CpuId, EnvType, Machine, UserError};

fn breakpoint_with_input(input: &[u8]) -> (Machine, exokernel::EnvId, Result<(), UserError>) {
    let mut m = machine(1);
    let id = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();
    m.console().take_output();

    m.console().push_input(input);
    let r = m.with_env_context(CpuId(0), |ctx| ctx.int(T_BRKPT)).unwrap();
    (m, id, r)
}

#[test]
fn breakpoint_runs_scripted_commands_then_continues() {
    let (m, id, r) = breakpoint_with_input(b"help\nkerninfo\nbogus\ncontinue\n");
    assert_eq!(r, Ok(()));

    let out = m.console().output_string();
    assert!(out.starts_with("Welcome to the JOS kernel monitor!\n"));
    assert!(out.contains("Type 'help' for a list of commands.\n"));
    assert!(out.contains("TRAP frame from CPU 0"));
    assert!(out.contains("  trap 0x00000003 Breakpoint"));
    assert!(out.contains("K> help\n"));
    assert!(out.contains("help - Display this list of commands\n"));
    assert!(out.contains("kerninfo - Display information about the kernel\n"));
    assert!(out.contains("c - Alias for continue\n"));
    assert!(out.contains("Physical frames:"));
    assert!(out.contains("Unknown command 'bogus'\n"));

    // continue の後はもう何も読まない
    assert!(out.trim_end().ends_with("K> continue"));
    assert_eq!(m.kernel().current_env(CpuId(0)), Some(id));
}

#[test]
fn monitor_returns_when_input_runs_out() {
    let (m, id, r) = breakpoint_with_input(b"help\n");
    assert_eq!(r, Ok(()));
    assert!(m.console().output_string().contains("help - "));
    assert!(m.kernel().env_alive(id));
}

#[test]
fn envs_command_lists_live_environments() {
    let (m, id, r) = breakpoint_with_input(b"envs\nc\n");
    assert_eq!(r, Ok(()));
    let out = m.console().output_string();
    assert!(out.contains(&format!("{} parent 00000000 Running runs 1\n", id)));
}

#[test]
fn line_editing_handles_backspace() {
    let (m, _id, r) = breakpoint_with_input(b"helx\x08p\n");
    assert_eq!(r, Ok(()));
    let out = m.console().output_string();
    assert!(out.contains("K> help\n"));
    assert!(out.contains("help - Display this list of commands\n"));
}

#[test]
fn privileged_vector_from_user_is_a_protection_fault() {
    let mut m = machine(1);
    let id = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();

    let r = m.with_env_context(CpuId(0), |ctx| ctx.int(T_PGFLT)).unwrap();
    assert_eq!(r, Err(UserError::Destroyed));
    let out = m.console().output_string();
    assert!(out.contains("  trap 0x0000000d General Protection"));
    assert!(out.contains(&format!("[{}] free env {}", id, id)));
}
