// kernel/src/mem/layout.rs
//
// i386 仮想アドレスレイアウト（仕様レベル）
//
// 目的:
// - 「ユーザ空間」と「カーネル空間＋物理メモリ窓」の境界を定数として固定しておく。
// - 権限チェック（ULIM）、fork の走査範囲（USTACKTOP）、teardown の範囲（UTOP）は
//   すべてここの定数を参照する。
//
// レイアウト:
//
//    4 Gig -------->  +------------------------------+
//                     |  物理メモリ窓 (KERNBASE..)    | RW/--
//    KERNBASE ----->  +------------------------------+ 0xf0000000
//                     |  CPU0 kstack / gap / CPU1 ... | RW/--
//    MMIOLIM ------>  +------------------------------+ 0xefc00000
//                     |  (MMIO, 未使用)               |
//    ULIM ---------->  +------------------------------+ 0xef800000
//                     |  UVPT: 自分自身のページテーブル | R-/R-
//    UVPT ---------->  +------------------------------+ 0xef400000
//                     |  UPAGES / UENVS (未マップ)    |
//    UTOP, UENVS --->  +------------------------------+ 0xeec00000
//    UXSTACKTOP     |  例外スタック (1 page)        | RW/RW
//                     +------------------------------+ 0xeebff000
//                     |  空き (guard)                 |
//    USTACKTOP  --->  +------------------------------+ 0xeebfe000
//                     |  通常のユーザスタック           | RW/RW
//                     ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//    UTEXT -------->  +------------------------------+ 0x00800000
//    PFTEMP ------->  |  COW 用の一時ページ             |
//                     +------------------------------+ 0x00000000

use super::addr::{PAGE_SIZE, PT_SIZE};

pub const KERNBASE: u32 = 0xF000_0000;

pub const KSTACKTOP: u32 = KERNBASE;
pub const KSTKSIZE: u32 = 8 * PAGE_SIZE;
pub const KSTKGAP: u32 = 8 * PAGE_SIZE;

pub const MMIOLIM: u32 = KSTACKTOP - PT_SIZE;
pub const MMIOBASE: u32 = MMIOLIM - PT_SIZE;

/// user/kernel の境界。これ以上はユーザから一切アクセスできない。
pub const ULIM: u32 = MMIOBASE;

/// ページディレクトリの自己マップ窓
pub const UVPT: u32 = ULIM - PT_SIZE;
pub const UPAGES: u32 = UVPT - PT_SIZE;
pub const UENVS: u32 = UPAGES - PT_SIZE;

/// ユーザが自由に使える範囲の上端
pub const UTOP: u32 = UENVS;

/// 例外スタック（1 page）の上端
pub const UXSTACKTOP: u32 = UTOP;

/// 通常スタックの上端（例外スタックとの間に 1 page の guard）
pub const USTACKTOP: u32 = UTOP - 2 * PAGE_SIZE;

pub const UTEXT: u32 = 2 * PT_SIZE;

/// COW 処理用の一時マップ位置
pub const PFTEMP: u32 = UTEXT - PAGE_SIZE;

/// 物理: BIOS / IO hole
pub const IOPHYSMEM: u32 = 0x0A_0000;
pub const EXTPHYSMEM: u32 = 0x10_0000;

/// AP 起動用トランポリンの物理ページ
pub const MPENTRY_PADDR: u32 = 0x7000;

/// ブロックキャッシュが使う仮想領域
pub const DISKMAP: u32 = 0x1000_0000;
pub const DISKSIZE: u32 = 0xC000_0000;

/// CPU n のカーネルスタック上端
pub const fn kstack_top(cpu: usize) -> u32 {
    KSTACKTOP - (cpu as u32) * (KSTKSIZE + KSTKGAP)
}
