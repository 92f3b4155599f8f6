/*!
 * types
 *
 * 役割:
 *   - CPU 番号と、ブート時に渡される物理メモリマップ。
 *
 * やらないこと:
 *   - フレーム単位の管理（mm 側）。
 *
 * [不変条件]
 *   - MemoryMap の region は start の昇順で重ならない。
 */

use alloc::vec;
use alloc::vec::Vec;

use crate::mem::layout::{EXTPHYSMEM, IOPHYSMEM};

/// CPU 番号（0 = BSP）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    /// IO hole など、フレームとして配らない範囲
    Reserved,
}

/// [start, end) の物理アドレス範囲
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub start: u32,
    pub end: u32,
    pub kind: RegionKind,
}

/// BIOS / CMOS 相当が渡すメモリマップ
#[derive(Clone, Debug)]
pub struct MemoryMap {
    pub regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// PC 互換の配置: base memory [0, 640K)、IO hole [640K, 1M)、extended [1M, total)
    pub fn pc_layout(total_bytes: u32) -> MemoryMap {
        let mut regions = vec![
            MemoryRegion { start: 0, end: IOPHYSMEM, kind: RegionKind::Usable },
            MemoryRegion { start: IOPHYSMEM, end: EXTPHYSMEM, kind: RegionKind::Reserved },
        ];
        if total_bytes > EXTPHYSMEM {
            regions.push(MemoryRegion {
                start: EXTPHYSMEM,
                end: total_bytes,
                kind: RegionKind::Usable,
            });
        }
        MemoryMap { regions }
    }

    fn usable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| r.kind == RegionKind::Usable)
    }

    pub fn top_of_memory(&self) -> u32 {
        self.usable().map(|r| r.end).max().unwrap_or(0)
    }

    /// 0 番地から始まる base memory の大きさ
    pub fn base_memory(&self) -> u32 {
        self.usable()
            .find(|r| r.start == 0)
            .map_or(0, |r| r.end.min(IOPHYSMEM))
    }

    pub fn is_usable(&self, pa: u32) -> bool {
        self.usable().any(|r| r.start <= pa && pa < r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_layout_leaves_the_io_hole_out() {
        let map = MemoryMap::pc_layout(32 * 1024 * 1024);
        assert_eq!(map.top_of_memory(), 32 * 1024 * 1024);
        assert_eq!(map.base_memory(), IOPHYSMEM);
        assert!(map.is_usable(0x1000));
        assert!(!map.is_usable(IOPHYSMEM));
        assert!(!map.is_usable(EXTPHYSMEM - 1));
        assert!(map.is_usable(EXTPHYSMEM));
    }

    #[test]
    fn tiny_machine_has_no_extended_memory() {
        let map = MemoryMap::pc_layout(EXTPHYSMEM);
        assert_eq!(map.regions.len(), 2);
        assert_eq!(map.top_of_memory(), IOPHYSMEM);
    }
}
