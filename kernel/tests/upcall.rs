mod common;

use std::sync::Mutex;

use common::*;
use exokernel::arch::trapframe::{UTrapframe, UTRAPFRAME_SIZE};
use exokernel::machine::{UserContext, UserError};
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::layout::{USTACKTOP, UXSTACKTOP};
use exokernel::user::pgfault::{set_pgfault_handler, PFENTRY};
use exokernel::user::syscall::{sys_env_set_pgfault_upcall, sys_page_alloc};
use exokernel::{CpuId, EnvId, EnvType, Machine};

const FAULT_VA: u32 = 0x0050_0000;
const OTHER_VA: u32 = 0x0060_0000;
const FRAME_TOP: u32 = UXSTACKTOP - UTRAPFRAME_SIZE as u32;

fn running(m: &mut Machine) -> EnvId {
    let id = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();
    id
}

/// フォルトしたページに書き込み可能なページを張る
fn map_fault_page(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let page = VirtAddr(utf.fault_va).align_down();
    sys_page_alloc(ctx, EnvId::NONE, page, URW)
}

// ─────────────────────────────────────────────

static LAYOUT: Mutex<Vec<(UTrapframe, u32, u32)>> = Mutex::new(Vec::new());

fn record_layout(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let live = ctx.live_context()?;
    LAYOUT.lock().unwrap().push((*utf, live.eip, live.esp));
    map_fault_page(ctx, utf)
}

#[test]
fn upcall_frame_describes_the_trap_time_state() {
    let mut m = machine(1);
    running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            set_pgfault_handler(ctx, record_layout)?;
            ctx.store_u8(VirtAddr(FAULT_VA + 4), 0x5A)?;
            let back = ctx.load_u8(VirtAddr(FAULT_VA + 4))?;
            let live = ctx.live_context()?;
            Ok::<_, UserError>((back, live.eip, live.esp))
        })
        .unwrap();
    // pfentry で trap-time の eip / esp に戻っている
    assert_eq!(r, Ok((0x5A, ENTRY, USTACKTOP)));

    let seen = LAYOUT.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (utf, eip, esp) = seen[0];
    assert_eq!(utf.fault_va, FAULT_VA + 4);
    // user | write | not present
    assert_eq!(utf.err, 6);
    assert_eq!(utf.eip, ENTRY);
    assert_eq!(utf.esp, USTACKTOP);
    assert_eq!(eip, PFENTRY);
    assert_eq!(esp, FRAME_TOP);
    assert_eq!(esp, 0xeebf_ffcc);
}

// ─────────────────────────────────────────────

static PROT: Mutex<Vec<u32>> = Mutex::new(Vec::new());

fn record_err(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    PROT.lock().unwrap().push(utf.err);
    map_fault_page(ctx, utf)
}

#[test]
fn write_to_read_only_page_reports_protection_violation() {
    let mut m = machine(1);
    running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            set_pgfault_handler(ctx, record_err)?;
            sys_page_alloc(ctx, EnvId::NONE, VirtAddr(FAULT_VA), UR)?;
            ctx.store_u8(VirtAddr(FAULT_VA), 1)?;
            // 読み込みは UR のままでも通るが、いまは URW に張り替わっている
            ctx.load_u8(VirtAddr(FAULT_VA))
        })
        .unwrap();
    assert_eq!(r, Ok(0));
    // user | write | present
    assert_eq!(PROT.lock().unwrap().clone(), vec![7]);
}

// ─────────────────────────────────────────────

static NESTED: Mutex<Vec<(u32, u32, u32)>> = Mutex::new(Vec::new());

fn nested_handler(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let live = ctx.live_context()?;
    NESTED.lock().unwrap().push((utf.fault_va, utf.esp, live.esp));
    if utf.fault_va == FAULT_VA {
        // ハンドラの中でもう一度フォルトする
        ctx.store_u8(VirtAddr(OTHER_VA), 2)?;
    }
    map_fault_page(ctx, utf)
}

#[test]
fn recursive_fault_leaves_one_word_of_slack() {
    let mut m = machine(1);
    running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            set_pgfault_handler(ctx, nested_handler)?;
            ctx.store_u8(VirtAddr(FAULT_VA), 1)?;
            let a = ctx.load_u8(VirtAddr(FAULT_VA))?;
            let b = ctx.load_u8(VirtAddr(OTHER_VA))?;
            Ok::<_, UserError>((a, b))
        })
        .unwrap();
    assert_eq!(r, Ok((1, 2)));

    let seen = NESTED.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (FAULT_VA, USTACKTOP, FRAME_TOP),
            (OTHER_VA, FRAME_TOP, FRAME_TOP - UTRAPFRAME_SIZE as u32 - 4),
        ]
    );
    with_state(&m, |ks| assert_eq!(ks.counters.upcalls, 2));
}

// ─────────────────────────────────────────────

fn runaway_handler(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    // 毎回まだ無いページに触る
    ctx.store_u8(VirtAddr(utf.fault_va + PAGE_SIZE), 0)
}

#[test]
fn exception_stack_overflow_destroys_the_env() {
    let mut m = machine(1);
    let id = running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            set_pgfault_handler(ctx, runaway_handler)?;
            ctx.store_u8(VirtAddr(FAULT_VA), 1)
        })
        .unwrap();
    assert_eq!(r, Err(UserError::Destroyed));
    assert!(!m.kernel().env_alive(id));
    assert!(m
        .console()
        .output_string()
        .contains(&format!("[{}] user_mem_check assertion failure for va ", id)));
}

#[test]
fn upcall_without_exception_stack_destroys_the_env() {
    let mut m = machine(1);
    let id = running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            sys_env_set_pgfault_upcall(ctx, EnvId::NONE, VirtAddr(PFENTRY))?;
            ctx.store_u8(VirtAddr(FAULT_VA), 1)
        })
        .unwrap();
    assert_eq!(r, Err(UserError::Destroyed));
    assert!(m
        .console()
        .output_string()
        .contains(&format!("[{}] user_mem_check assertion failure for va eebfffcc", id)));
}

#[test]
fn fault_without_upcall_destroys_the_env() {
    let mut m = machine(1);
    let id = running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| ctx.store_u8(VirtAddr(FAULT_VA), 1))
        .unwrap();
    assert_eq!(r, Err(UserError::Destroyed));

    let out = m.console().output_string();
    assert!(out.contains(&format!("[{}] user fault va 00500000 ip 00800020", id)));
    assert!(out.contains("TRAP frame from CPU 0"));
    with_state(&m, |ks| {
        assert_eq!(ks.counters.user_faults, 1);
        assert!(ks.env(id).is_none());
    });
}

// ─────────────────────────────────────────────

static DEPTH: Mutex<Vec<u32>> = Mutex::new(Vec::new());

fn record_depth(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    DEPTH.lock().unwrap().push(ctx.thisenv()?.xstack.depth());
    map_fault_page(ctx, utf)
}

#[test]
fn exception_stack_is_tracked_per_env_not_by_esp() {
    let mut m = machine(1);
    let id = running(&mut m);

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            set_pgfault_handler(ctx, record_depth)?;
            ctx.store_u8(VirtAddr(FAULT_VA), 1)?;
            ctx.store_u8(VirtAddr(OTHER_VA), 2)?;
            Ok::<_, UserError>(ctx.thisenv()?.xstack.is_active())
        })
        .unwrap();
    // ハンドラの中では 1、戻った後は 0
    assert_eq!(r, Ok(false));
    assert_eq!(DEPTH.lock().unwrap().clone(), vec![1, 1]);
    with_state(&m, |ks| {
        assert_eq!(ks.env(id).unwrap().xstack.depth(), 0);
        assert_eq!(ks.counters.upcalls, 2);
    });
}

#[test]
fn fault_with_esp_in_the_stack_gap_destroys_the_env() {
    let mut m = machine(1);
    let id = running(&mut m);
    m.with_env_context(CpuId(0), |ctx| set_pgfault_handler(ctx, map_fault_page))
        .unwrap()
        .unwrap();

    // 通常スタックと例外スタックの間を指す esp
    let mut tf = m.platform().live_context(CpuId(0)).unwrap();
    tf.esp = USTACKTOP + 0x100;
    m.platform().set_live_context(CpuId(0), tf);

    let r = m
        .with_env_context(CpuId(0), |ctx| ctx.store_u8(VirtAddr(FAULT_VA), 1))
        .unwrap();
    assert_eq!(r, Err(UserError::Destroyed));
    assert!(!m.kernel().env_alive(id));
    assert!(m
        .console()
        .output_string()
        .contains(&format!("[{}] user_mem_check assertion failure for va eebfe100", id)));
    with_state(&m, |ks| assert_eq!(ks.counters.upcalls, 0));
}
