// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - 物理メモリ全体を 4KiB フレームの配列として持ち、フレームごとに PageInfo（参照数 + free link）を置く。
// - free list が出来上がる前は boot_alloc（バンプアロケータ）だけが使える。
// - 状態は構造体 + カウンタに閉じ込める（グローバル変数にしない）。
//
// [不変条件]
// - free list 上にある ⇔ ref_count == 0
//   （ブート時に予約したフレームは ref_count = 1 で固定し、free list に入れない）
// - 参照が残っているフレームを release するのは呼び出し側のバグ → panic。
//
// 設計メモ:
// - allocate() は参照数 0 のまま返す。参照数を上げるのは insert 側の責務。
//   そのため allocate と insert の間だけ「どちらでもない」フレームが一瞬存在する。

pub mod pagetable_init;

use alloc::vec;
use alloc::vec::Vec;

use crate::logging;
use crate::mem::addr::{PhysAddr, PhysFrame, PAGE_SIZE};
use crate::mem::layout::{IOPHYSMEM, MPENTRY_PADDR};
use crate::types::MemoryMap;

const PGSIZE: usize = PAGE_SIZE as usize;

/// 物理ページ 1 枚分の管理情報
#[derive(Clone, Copy, Debug, Default)]
pub struct PageInfo {
    pub ref_count: u16,
    next_free: Option<u32>,
    on_free_list: bool,
}

/// カーネル側から見える「物理メモリマネージャ」。
/// - 外部 API はすべて safe にする。
/// - フレームの中身（ページテーブルを含む）もここが所有する。
pub struct PhysicalMemoryManager {
    memory: Vec<u8>,
    pages: Vec<PageInfo>,
    npages: usize,
    npages_basemem: usize,

    free_head: Option<u32>,
    free_count: usize,

    // boot_alloc の次の空き（物理アドレス）。free list 構築後は伸ばせない。
    boot_next: u32,
    free_list_ready: bool,
}

impl PhysicalMemoryManager {
    /// メモリマップとカーネルイメージの終端から構築する。
    ///
    /// # 設計上の前提
    /// - カーネル全体で PhysicalMemoryManager は 1 インスタンスのみ保持すること。
    /// - この時点ではまだ free list は無い（boot_alloc → page_init の順で使う）。
    pub fn new(map: &MemoryMap, kernel_end: PhysAddr) -> Self {
        let top = map.top_of_memory();
        let npages = (top / PAGE_SIZE) as usize;
        let npages_basemem = (map.base_memory() / PAGE_SIZE) as usize;

        logging::info("mm: physical memory detected");
        logging::info_u64(" npages", npages as u64);
        logging::info_u64(" basemem_kb", (npages_basemem * PGSIZE / 1024) as u64);

        PhysicalMemoryManager {
            memory: vec![0u8; npages * PGSIZE],
            pages: vec![PageInfo::default(); npages],
            npages,
            npages_basemem,
            free_head: None,
            free_count: 0,
            boot_next: round_up(kernel_end.0),
            free_list_ready: false,
        }
    }

    // ─────────────────────────────────────────────
    // boot-time bump allocator
    // ─────────────────────────────────────────────

    /// free list が出来る前の確保。n バイトをページ境界に丸めて確保し、先頭を返す。
    /// n == 0 なら次の空きアドレスを返すだけ。
    pub fn boot_alloc(&mut self, n: u32) -> PhysAddr {
        let result = PhysAddr(self.boot_next);
        if n == 0 {
            return result;
        }
        if self.free_list_ready {
            panic!("boot_alloc: called after page_init");
        }

        let end = match self.boot_next.checked_add(n) {
            Some(e) => round_up(e),
            None => panic!("boot_alloc: out of memory"),
        };
        if end as usize > self.npages * PGSIZE {
            panic!("boot_alloc: out of memory");
        }
        self.boot_next = end;
        result
    }

    /// free list を構築する。
    /// 除外するもの:
    /// - page 0（実モード IDT / BIOS 構造体）
    /// - MPENTRY_PADDR（AP 起動トランポリン）
    /// - [IOPHYSMEM, EXTPHYSMEM)（IO hole）
    /// - [EXTPHYSMEM, boot_alloc(0))（カーネルイメージ + ブート時確保分）
    pub fn page_init(&mut self) {
        let mpentry = (MPENTRY_PADDR / PAGE_SIZE) as usize;
        let io_start = (IOPHYSMEM / PAGE_SIZE) as usize;
        let kernel_end = (self.boot_alloc(0).0 / PAGE_SIZE) as usize;

        for i in 0..self.npages {
            let reserved = i == 0
                || i == mpentry
                || (i >= self.npages_basemem.min(io_start) && i < kernel_end);

            if reserved {
                self.pages[i].ref_count = 1;
                self.pages[i].on_free_list = false;
                self.pages[i].next_free = None;
            } else {
                self.pages[i].ref_count = 0;
                self.push_free(i as u32);
            }
        }
        self.free_list_ready = true;

        logging::info("mm: page_init done");
        logging::info_u64(" free_pages", self.free_count as u64);
    }

    // ─────────────────────────────────────────────
    // free list
    // ─────────────────────────────────────────────

    fn push_free(&mut self, idx: u32) {
        let p = &mut self.pages[idx as usize];
        p.next_free = self.free_head;
        p.on_free_list = true;
        self.free_head = Some(idx);
        self.free_count += 1;
    }

    /// free list の先頭を 1 枚取り出す。zero なら中身を 0 で埋める。
    /// - 成功: Some(PhysFrame)（参照数は 0 のまま）
    /// - free list が空: None（ここでは致命扱いしない）
    pub fn allocate(&mut self, zero: bool) -> Option<PhysFrame> {
        let idx = self.free_head?;
        let page = &mut self.pages[idx as usize];
        self.free_head = page.next_free;
        page.next_free = None;
        page.on_free_list = false;
        self.free_count -= 1;

        let frame = PhysFrame::from_index(idx);
        if zero {
            self.frame_bytes_mut(frame).fill(0);
        }
        Some(frame)
    }

    /// 参照数 0 のフレームを free list に戻す。
    pub fn release(&mut self, frame: PhysFrame) {
        let idx = frame.index();
        if idx >= self.npages {
            panic!("page_free: frame out of range");
        }
        let page = self.pages[idx];
        if page.ref_count != 0 {
            panic!("page_free: frame still referenced");
        }
        if page.on_free_list {
            panic!("page_free: double free");
        }
        self.push_free(frame.number);
    }

    /// 参照数を 1 減らし、0 になったら release する。
    pub fn decref(&mut self, frame: PhysFrame) {
        let idx = frame.index();
        if idx >= self.npages {
            panic!("page_decref: frame out of range");
        }
        let page = &mut self.pages[idx];
        if page.ref_count == 0 {
            panic!("page_decref: reference count underflow");
        }
        page.ref_count -= 1;
        if page.ref_count == 0 {
            self.release(frame);
        }
    }

    pub fn incref(&mut self, frame: PhysFrame) {
        let page = &mut self.pages[frame.index()];
        page.ref_count = match page.ref_count.checked_add(1) {
            Some(n) => n,
            None => panic!("page_incref: reference count overflow"),
        };
    }

    pub fn ref_count(&self, frame: PhysFrame) -> u16 {
        self.pages[frame.index()].ref_count
    }

    pub fn is_free(&self, frame: PhysFrame) -> bool {
        self.pages[frame.index()].on_free_list
    }

    pub fn contains(&self, frame: PhysFrame) -> bool {
        frame.index() < self.npages
    }

    pub fn total_frames(&self) -> usize {
        self.npages
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// 参照数が 1 以上のフレーム数（予約分を含む）
    pub fn in_use_frames(&self) -> usize {
        self.pages.iter().filter(|p| p.ref_count > 0).count()
    }

    /// free list の自己検査。壊れていたら panic（カーネル内部の不整合）。
    /// - 重複なし / 範囲内 / ref_count == 0 / on_free_list が立っている
    /// - リスト長 == free_count
    /// - ref_count == 0 なのに free list に居ないフレームが無い
    pub fn check_free_list(&self) {
        let mut seen = vec![false; self.npages];
        let mut len = 0usize;
        let mut cur = self.free_head;

        while let Some(idx) = cur {
            let i = idx as usize;
            assert!(i < self.npages, "check_free_list: index out of range");
            assert!(!seen[i], "check_free_list: cycle or duplicate");
            seen[i] = true;

            let p = &self.pages[i];
            assert!(p.ref_count == 0, "check_free_list: free page has references");
            assert!(p.on_free_list, "check_free_list: flag mismatch");
            assert!(i != 0, "check_free_list: page 0 is free");

            len += 1;
            cur = p.next_free;
        }

        assert!(len == self.free_count, "check_free_list: count mismatch");

        for (i, p) in self.pages.iter().enumerate() {
            if p.ref_count == 0 {
                assert!(seen[i], "check_free_list: unreferenced page not on free list");
            }
        }
    }

    // ─────────────────────────────────────────────
    // フレームの中身
    // ─────────────────────────────────────────────

    pub fn frame_bytes(&self, frame: PhysFrame) -> &[u8] {
        let start = frame.index() * PGSIZE;
        &self.memory[start..start + PGSIZE]
    }

    pub fn frame_bytes_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        let start = frame.index() * PGSIZE;
        &mut self.memory[start..start + PGSIZE]
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let off = pa.0 as usize;
        let mut w = [0u8; 4];
        w.copy_from_slice(&self.memory[off..off + 4]);
        u32::from_le_bytes(w)
    }

    pub fn write_u32(&mut self, pa: PhysAddr, value: u32) {
        let off = pa.0 as usize;
        self.memory[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// 物理アドレスから読み出す（1 フレーム内に収まること）
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) {
        let off = pa.0 as usize;
        buf.copy_from_slice(&self.memory[off..off + buf.len()]);
    }

    /// 物理アドレスへ書き込む（1 フレーム内に収まること）
    pub fn write_phys(&mut self, pa: PhysAddr, data: &[u8]) {
        let off = pa.0 as usize;
        self.memory[off..off + data.len()].copy_from_slice(data);
    }

    /// 1 フレームの中身をまるごと別フレームへ
    pub fn copy_frame(&mut self, dst: PhysFrame, src: PhysFrame) {
        let s = src.index() * PGSIZE;
        let d = dst.index() * PGSIZE;
        self.memory.copy_within(s..s + PGSIZE, d);
    }
}

fn round_up(v: u32) -> u32 {
    (v + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::layout::EXTPHYSMEM;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_pmm() -> PhysicalMemoryManager {
        // 4MiB, kernel image 256KiB
        let map = MemoryMap::pc_layout(4 * 1024 * 1024);
        let mut pmm = PhysicalMemoryManager::new(&map, PhysAddr(EXTPHYSMEM + 256 * 1024));
        pmm.boot_alloc(PAGE_SIZE); // kern_pgdir 相当
        pmm.page_init();
        pmm
    }

    #[test]
    fn page_init_excludes_reserved_ranges() {
        let pmm = small_pmm();
        let kernel_end = pmm.boot_alloc_end_for_test();

        assert!(!pmm.is_free(PhysFrame::from_index(0)));
        assert!(!pmm.is_free(PhysAddr(MPENTRY_PADDR).frame()));
        assert!(!pmm.is_free(PhysAddr(IOPHYSMEM).frame()));
        assert!(!pmm.is_free(PhysAddr(EXTPHYSMEM - PAGE_SIZE).frame()));
        assert!(!pmm.is_free(PhysAddr(EXTPHYSMEM).frame()));
        assert!(!pmm.is_free(PhysAddr(kernel_end - PAGE_SIZE).frame()));

        assert!(pmm.is_free(PhysFrame::from_index(1)));
        assert!(pmm.is_free(PhysAddr(kernel_end).frame()));
        pmm.check_free_list();

        assert_eq!(pmm.free_frames() + pmm.in_use_frames(), pmm.total_frames());
    }

    #[test]
    #[should_panic(expected = "reference count overflow")]
    fn incref_past_the_counter_width_panics() {
        let mut pmm = small_pmm();
        let f = pmm.allocate(false).unwrap();
        for _ in 0..u16::MAX {
            pmm.incref(f);
        }
        assert_eq!(pmm.ref_count(f), u16::MAX);
        pmm.incref(f);
    }

    #[test]
    fn allocate_zero_clears_contents() {
        let mut pmm = small_pmm();
        let f = pmm.allocate(false).unwrap();
        pmm.frame_bytes_mut(f).fill(0x5A);
        pmm.release(f);

        // LIFO なので同じフレームが戻ってくる
        let g = pmm.allocate(true).unwrap();
        assert_eq!(f, g);
        assert!(pmm.frame_bytes(g).iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_returns_none_and_recovers() {
        let mut pmm = small_pmm();
        let mut got = Vec::new();
        while let Some(f) = pmm.allocate(false) {
            got.push(f);
        }
        assert_eq!(pmm.free_frames(), 0);
        assert!(pmm.allocate(true).is_none());

        for f in got {
            pmm.release(f);
        }
        pmm.check_free_list();
    }

    #[test]
    fn decref_to_zero_returns_frame() {
        let mut pmm = small_pmm();
        let before = pmm.free_frames();
        let f = pmm.allocate(true).unwrap();
        pmm.incref(f);
        pmm.incref(f);
        pmm.decref(f);
        assert!(!pmm.is_free(f));
        pmm.decref(f);
        assert!(pmm.is_free(f));
        assert_eq!(pmm.free_frames(), before);
    }

    #[test]
    #[should_panic(expected = "still referenced")]
    fn release_referenced_frame_panics() {
        let mut pmm = small_pmm();
        let f = pmm.allocate(false).unwrap();
        pmm.incref(f);
        pmm.release(f);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_release_panics() {
        let mut pmm = small_pmm();
        let f = pmm.allocate(false).unwrap();
        pmm.release(f);
        pmm.release(f);
    }

    #[test]
    fn random_sequences_conserve_frames() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut pmm = small_pmm();
        let total = pmm.total_frames();
        let mut held: Vec<PhysFrame> = Vec::new();

        for _ in 0..5000 {
            if rng.gen_bool(0.55) {
                if let Some(f) = pmm.allocate(rng.gen()) {
                    pmm.incref(f);
                    held.push(f);
                }
            } else if !held.is_empty() {
                let i = rng.gen_range(0..held.len());
                let f = held.swap_remove(i);
                pmm.decref(f);
            }
            assert_eq!(pmm.free_frames() + pmm.in_use_frames(), total);
        }
        pmm.check_free_list();
    }

    #[test]
    #[should_panic(expected = "after page_init")]
    fn boot_alloc_after_page_init_panics() {
        let mut pmm = small_pmm();
        pmm.boot_alloc(PAGE_SIZE);
    }

    impl PhysicalMemoryManager {
        fn boot_alloc_end_for_test(&self) -> u32 {
            self.boot_next
        }
    }
}
