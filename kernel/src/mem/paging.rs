// kernel/src/mem/paging.rs
//
// PTE / PDE の表現と、ページ単位のメモリ操作イベント。
// - ハードウェアが解釈するビットはそのまま、AVAIL の 2 bit を COW / SHARE に使う。
// - MemAction は「何をマップ/解除したか」を LogEvent に載せるための抽象。

use core::fmt;

use crate::mem::addr::{PhysAddr, PhysFrame, VirtPage};

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    /// - SHARE: fork で COW にせず共有する（ソフトウェア定義）
    /// - COW: copy-on-write（ソフトウェア定義、WRITABLE と同時に立たない）
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        const SHARE = 1 << 10;
        const COW = 1 << 11;

        /// ソフトウェアが自由に使える 3 bit
        const AVAIL = 0xE00;

        /// syscall でユーザが指定してよいビット
        const SYSCALL = Self::AVAIL.bits()
            | Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits();
    }
}

const ADDR_MASK: u32 = !0xFFF;

/// 1 エントリ（PDE / PTE 共通）
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(pub u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: PhysFrame, flags: PteFlags) -> Pte {
        Pte(frame.start_address().0 | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !ADDR_MASK)
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & ADDR_MASK)
    }

    pub fn frame(self) -> PhysFrame {
        self.addr().frame()
    }

    pub fn with_flags(self, flags: PteFlags) -> Pte {
        Pte((self.0 & ADDR_MASK) | flags.bits())
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#010x} {:?})", self.addr().0, self.flags())
    }
}

/// ページ単位のメモリ操作を表現する抽象イベント。
///
/// - Map: 「この仮想ページを、この物理フレームに、この属性でマップした」
/// - Unmap: 「この仮想ページのマッピングを解除した」
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAction {
    Map {
        page: VirtPage,
        frame: PhysFrame,
        flags: PteFlags,
    },
    Unmap {
        page: VirtPage,
    },
}
