// kernel/src/arch/trapframe.rs
//
// 役割:
// - トラップ時に保存される実行コンテキスト（Trapframe）と、
//   ページフォルト upcall 用にユーザスタックへ積む UTrapframe を定義する。
//
// やること:
// - レジスタ配置を i386 のレイアウト（68 byte / 52 byte）でバイト列に出し入れする。
//   sys_env_set_trapframe や upcall はユーザメモリ越しにこの形を読む/書く。
// - cs の RPL から「どの特権レベルで trap したか」を判定する。
//
// やらないこと:
// - 実際のレジスタ復帰（それは Platform::resume の責務）

use x86_64::registers::rflags::RFlags;
use x86_64::PrivilegeLevel;

// ─────────────────────────────────────────────
// セグメントセレクタ（GDT の並びは固定）
// ─────────────────────────────────────────────

pub const GD_KT: u16 = 0x08; // kernel text
pub const GD_KD: u16 = 0x10; // kernel data
pub const GD_UT: u16 = 0x18; // user text
pub const GD_UD: u16 = 0x20; // user data

const RPL_USER: u16 = 3;

pub const FL_IF: u32 = RFlags::INTERRUPT_FLAG.bits() as u32;
pub const FL_IOPL_MASK: u32 = (RFlags::IOPL_LOW.bits() | RFlags::IOPL_HIGH.bits()) as u32;
pub const FL_IOPL_3: u32 = FL_IOPL_MASK;

/// pusha の並び
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // 使わない
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

pub const PUSHREGS_SIZE: usize = 32;

impl PushRegs {
    fn write_to(&self, out: &mut [u8]) {
        let words = [
            self.edi, self.esi, self.ebp, self.oesp, self.ebx, self.edx, self.ecx, self.eax,
        ];
        for (i, w) in words.iter().enumerate() {
            put_u32(out, i * 4, *w);
        }
    }

    fn read_from(src: &[u8]) -> PushRegs {
        PushRegs {
            edi: get_u32(src, 0),
            esi: get_u32(src, 4),
            ebp: get_u32(src, 8),
            oesp: get_u32(src, 12),
            ebx: get_u32(src, 16),
            edx: get_u32(src, 20),
            ecx: get_u32(src, 24),
            eax: get_u32(src, 28),
        }
    }
}

/// 保存された実行コンテキスト
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u16,
    pub ds: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
}

pub const TRAPFRAME_SIZE: usize = 68;

impl Trapframe {
    /// ユーザモードで entry から走り出すためのコンテキスト
    pub fn new_user(entry: u32, esp: u32) -> Trapframe {
        Trapframe {
            ds: GD_UD | RPL_USER,
            es: GD_UD | RPL_USER,
            ss: GD_UD | RPL_USER,
            cs: GD_UT | RPL_USER,
            esp,
            eip: entry,
            eflags: FL_IF,
            ..Trapframe::default()
        }
    }

    /// カーネルモード（halt 中の CPU など）で起きた trap 用
    pub fn new_kernel(trapno: u32) -> Trapframe {
        Trapframe {
            ds: GD_KD,
            es: GD_KD,
            ss: GD_KD,
            cs: GD_KT,
            trapno,
            ..Trapframe::default()
        }
    }

    pub fn privilege_level(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(self.cs & 3)
    }

    pub fn from_user(&self) -> bool {
        self.privilege_level() == PrivilegeLevel::Ring3
    }

    pub fn iopl(&self) -> u32 {
        (self.eflags & FL_IOPL_MASK) >> 12
    }

    pub fn to_bytes(&self) -> [u8; TRAPFRAME_SIZE] {
        let mut b = [0u8; TRAPFRAME_SIZE];
        self.regs.write_to(&mut b[..PUSHREGS_SIZE]);
        put_u32(&mut b, 32, self.es as u32);
        put_u32(&mut b, 36, self.ds as u32);
        put_u32(&mut b, 40, self.trapno);
        put_u32(&mut b, 44, self.err);
        put_u32(&mut b, 48, self.eip);
        put_u32(&mut b, 52, self.cs as u32);
        put_u32(&mut b, 56, self.eflags);
        put_u32(&mut b, 60, self.esp);
        put_u32(&mut b, 64, self.ss as u32);
        b
    }

    pub fn from_bytes(b: &[u8; TRAPFRAME_SIZE]) -> Trapframe {
        Trapframe {
            regs: PushRegs::read_from(&b[..PUSHREGS_SIZE]),
            es: get_u32(b, 32) as u16,
            ds: get_u32(b, 36) as u16,
            trapno: get_u32(b, 40),
            err: get_u32(b, 44),
            eip: get_u32(b, 48),
            cs: get_u32(b, 52) as u16,
            eflags: get_u32(b, 56),
            esp: get_u32(b, 60),
            ss: get_u32(b, 64) as u16,
        }
    }
}

/// ページフォルト upcall に渡すフレーム（例外スタック上に置く）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

pub const UTRAPFRAME_SIZE: usize = 52;

/// UTrapframe 内の trap-time eip / esp のオフセット（pfentry が使う）
pub const UTF_EIP_OFFSET: usize = 40;
pub const UTF_ESP_OFFSET: usize = 48;

impl UTrapframe {
    pub fn to_bytes(&self) -> [u8; UTRAPFRAME_SIZE] {
        let mut b = [0u8; UTRAPFRAME_SIZE];
        put_u32(&mut b, 0, self.fault_va);
        put_u32(&mut b, 4, self.err);
        self.regs.write_to(&mut b[8..8 + PUSHREGS_SIZE]);
        put_u32(&mut b, UTF_EIP_OFFSET, self.eip);
        put_u32(&mut b, 44, self.eflags);
        put_u32(&mut b, UTF_ESP_OFFSET, self.esp);
        b
    }

    pub fn from_bytes(b: &[u8; UTRAPFRAME_SIZE]) -> UTrapframe {
        UTrapframe {
            fault_va: get_u32(b, 0),
            err: get_u32(b, 4),
            regs: PushRegs::read_from(&b[8..8 + PUSHREGS_SIZE]),
            eip: get_u32(b, UTF_EIP_OFFSET),
            eflags: get_u32(b, 44),
            esp: get_u32(b, UTF_ESP_OFFSET),
        }
    }
}

fn put_u32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(src: &[u8], off: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&src[off..off + 4]);
    u32::from_le_bytes(w)
}
