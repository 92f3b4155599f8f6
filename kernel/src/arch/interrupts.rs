// kernel/src/arch/interrupts.rs
//
// 役割:
// - trap 番号と IRQ 番号の定義、および「どのベクタにゲートがあり、DPL はいくつか」の表。
//
// 設計方針:
// - 実際の IDT はエミュレートしない。ゲート表は
//   「ユーザが int n を直接叩いてよいか」の判定と trapname にだけ使う。
// - DPL 3 は breakpoint と syscall のみ。それ以外をユーザが int で呼ぶと #GP。

use x86_64::PrivilegeLevel;

pub const T_DIVIDE: u32 = 0;
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6;
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACK: u32 = 12;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
pub const T_FPERR: u32 = 16;
pub const T_ALIGN: u32 = 17;
pub const T_MCHK: u32 = 18;
pub const T_SIMDERR: u32 = 19;

pub const T_SYSCALL: u32 = 48;

pub const IRQ_OFFSET: u32 = 32;

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_SERIAL: u32 = 4;
pub const IRQ_SPURIOUS: u32 = 7;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;

const EXCEPTION_NAMES: [&str; 20] = [
    "Divide error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "(unknown trap)",
    "x87 FPU Floating-Point Error",
    "Alignment Check",
    "Machine-Check",
    "SIMD Floating-Point Exception",
];

pub fn trapname(trapno: u32) -> &'static str {
    if (trapno as usize) < EXCEPTION_NAMES.len() {
        return EXCEPTION_NAMES[trapno as usize];
    }
    if trapno == T_SYSCALL {
        return "System call";
    }
    if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&trapno) {
        return "Hardware Interrupt";
    }
    "(unknown trap)"
}

/// trap の大分類。trap_dispatch はまずこれで振り分ける
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapClass {
    Exception,
    Syscall,
    Irq(u32),
    Unknown,
}

pub fn classify(trapno: u32) -> TrapClass {
    match trapno {
        0..=19 => TrapClass::Exception,
        T_SYSCALL => TrapClass::Syscall,
        n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => TrapClass::Irq(n - IRQ_OFFSET),
        _ => TrapClass::Unknown,
    }
}

/// ゲートの DPL（ゲートが無いベクタは None）
pub fn gate_dpl(vector: u32) -> Option<PrivilegeLevel> {
    match vector {
        T_BRKPT | T_SYSCALL => Some(PrivilegeLevel::Ring3),
        9 | 15 => None,
        0..=19 => Some(PrivilegeLevel::Ring0),
        n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => Some(PrivilegeLevel::Ring0),
        _ => None,
    }
}

/// ユーザが `int vector` を実行したとき、実際に上がる trap 番号
pub fn software_interrupt_vector(vector: u32) -> u32 {
    match gate_dpl(vector) {
        Some(PrivilegeLevel::Ring3) => vector,
        _ => T_GPFLT,
    }
}
