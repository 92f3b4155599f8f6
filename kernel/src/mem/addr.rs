// kernel/src/mem/addr.rs
//
// 役割:
// - i386 の 32bit アドレスに型を付ける（PhysAddr / VirtAddr / PhysFrame / VirtPage）。
// - 2 段ページング用の分解: | PDX (10) | PTX (10) | offset (12) |
// やらないこと:
// - ページテーブルを読む / 書く（address_space.rs）。
//
// [不変条件]
// - PhysFrame::number / VirtPage::number は addr >> 12。u32 の範囲で閉じる。

use core::fmt;

pub const PAGE_SIZE: u32 = 4096;

/// PD / PT 1 枚あたりのエントリ数
pub const ENTRIES_PER_TABLE: usize = 1024;

/// PDE 1 個ぶんの範囲（4MiB）
pub const PT_SIZE: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

const OFFSET_MASK: u32 = PAGE_SIZE - 1;
const PDX_SHIFT: u32 = 22;
const PTX_SHIFT: u32 = 12;
const INDEX_MASK: u32 = 0x3FF;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysFrame {
    pub number: u32,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtPage {
    pub number: u32,
}

// ─────────────────────────────────────────────
// アドレス（バイト単位）
// ─────────────────────────────────────────────

impl PhysAddr {
    pub fn frame(self) -> PhysFrame {
        PhysFrame::from_index(self.0 >> PTX_SHIFT)
    }

    pub fn page_offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }
}

impl VirtAddr {
    pub fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !OFFSET_MASK)
    }

    /// 4GiB を越えるなら None（ULIM 付近の end 計算で使う）
    pub fn align_up(self) -> Option<VirtAddr> {
        self.0.checked_add(OFFSET_MASK).map(|v| VirtAddr(v & !OFFSET_MASK))
    }

    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub fn page(self) -> VirtPage {
        VirtPage::from_index(self.0 >> PTX_SHIFT)
    }

    pub fn pdx(self) -> usize {
        ((self.0 >> PDX_SHIFT) & INDEX_MASK) as usize
    }

    pub fn ptx(self) -> usize {
        ((self.0 >> PTX_SHIFT) & INDEX_MASK) as usize
    }

    pub fn page_offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    pub fn checked_add(self, n: u32) -> Option<VirtAddr> {
        self.0.checked_add(n).map(VirtAddr)
    }

    pub const fn from_indices(pdx: usize, ptx: usize) -> VirtAddr {
        VirtAddr(((pdx as u32) << PDX_SHIFT) | ((ptx as u32) << PTX_SHIFT))
    }
}

// ─────────────────────────────────────────────
// フレーム / ページ（4KiB 単位の番号）
// ─────────────────────────────────────────────

impl PhysFrame {
    pub const fn from_index(number: u32) -> Self {
        PhysFrame { number }
    }

    pub fn start_address(self) -> PhysAddr {
        PhysAddr(self.number << PTX_SHIFT)
    }

    pub fn index(self) -> usize {
        self.number as usize
    }
}

impl VirtPage {
    pub const fn from_index(number: u32) -> Self {
        VirtPage { number }
    }

    pub fn start_address(self) -> VirtAddr {
        VirtAddr(self.number << PTX_SHIFT)
    }
}

// ログでは全部 8 桁 16 進
macro_rules! hex_debug {
    ($ty:ident, |$s:ident| $val:expr) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let $s = self;
                write!(f, concat!(stringify!($ty), "({:#010x})"), $val)
            }
        }
    };
}

hex_debug!(PhysAddr, |a| a.0);
hex_debug!(VirtAddr, |a| a.0);
hex_debug!(PhysFrame, |fr| fr.start_address().0);
hex_debug!(VirtPage, |pg| pg.start_address().0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_directory_and_table_index() {
        let va = VirtAddr(0xeebf_dffc);
        assert_eq!(va.pdx(), 0x3ba);
        assert_eq!(va.ptx(), 0x3fd);
        assert_eq!(va.page_offset(), 0xffc);
        assert_eq!(VirtAddr::from_indices(va.pdx(), va.ptx()), va.align_down());
    }

    #[test]
    fn align_up_refuses_to_wrap() {
        assert_eq!(VirtAddr(0x1001).align_up(), Some(VirtAddr(0x2000)));
        assert_eq!(VirtAddr(0x2000).align_up(), Some(VirtAddr(0x2000)));
        assert_eq!(VirtAddr(0xffff_f001).align_up(), None);
    }

    #[test]
    fn frame_and_page_numbers_round_trip() {
        let pa = PhysAddr(0x0012_3456);
        assert_eq!(pa.frame().number, 0x123);
        assert_eq!(pa.frame().start_address(), PhysAddr(0x0012_3000));
        assert_eq!(VirtAddr(0x0080_0020).page().start_address(), VirtAddr(0x0080_0000));
    }
}
