// kernel/src/mem/address_space.rs
//
// 役割:
// - 2 段ページテーブル（PD → PT → frame）で表現される 1 つのアドレス空間。
// - ページテーブル自体も PhysicalMemoryManager のフレームの中に 1024 個の u32 として置く。
//
// やること:
// - walk / insert / lookup / remove / map_region（pmap の基本操作）
// - check_user_access: syscall 引数の権限チェック（最初に失敗したアドレスを返す）
// - teardown_user: UTOP 未満のマッピングとページテーブルを全部落とす
// - translate: ソフトウェア MMU。P/W/U を両レベルで見て、A/D ビットを立てる。
//
// やらないこと:
// - PSE の 4MiB ページ
// - TLB のキャッシュ（無効化の要否だけ TlbScope で判定して Platform に伝える）
//
// [不変条件]
// - ユーザが触れる PTE は必ず PRESENT|USER を含み、COW と WRITABLE は同時に立たない。
// - mapping を 1 本張るごとに対象フレームの ref_count を 1 上げ、外すたびに 1 下げる。
// - insert は「先に incref、後で古いマッピングを remove」。同じフレームを同じ va に
//   入れ直しても 0 にならない。

use x86_64::structures::idt::PageFaultErrorCode;

use crate::arch::Platform;
use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::mem::layout::{ULIM, UTOP};
use crate::mem::paging::{Pte, PteFlags};
use crate::mm::PhysicalMemoryManager;
use crate::types::CpuId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    Kernel,
    User,
}

/// ページテーブルの 1 エントリの置き場所（テーブルのフレーム + index）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    pub table: PhysFrame,
    pub index: usize,
}

impl PteSlot {
    fn addr(self) -> PhysAddr {
        PhysAddr(self.table.start_address().0 + (self.index as u32) * 4)
    }

    pub fn read(self, pmm: &PhysicalMemoryManager) -> Pte {
        Pte(pmm.read_u32(self.addr()))
    }

    pub fn write(self, pmm: &mut PhysicalMemoryManager, pte: Pte) {
        pmm.write_u32(self.addr(), pte.0);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// ページテーブル用のフレームが取れなかった
    NoMem,
}

/// MMU が 1 回のアクセスで確かめる条件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
}

impl Access {
    pub const USER_READ: Access = Access { write: false, user: true };
    pub const USER_WRITE: Access = Access { write: true, user: true };
    pub const KERNEL_READ: Access = Access { write: false, user: false };
    pub const KERNEL_WRITE: Access = Access { write: true, user: false };
}

/// TLB 無効化の範囲。
/// いまの CPU で動いている空間（active_root）を書き換えたときだけ invlpg を出す。
/// active_root が None（どの env も走っていない）なら常に出す。
pub struct TlbScope<'a> {
    platform: Option<&'a dyn Platform>,
    cpu: CpuId,
    active_root: Option<PhysFrame>,
}

impl<'a> TlbScope<'a> {
    pub fn new(platform: &'a dyn Platform, cpu: CpuId, active_root: Option<PhysFrame>) -> Self {
        TlbScope {
            platform: Some(platform),
            cpu,
            active_root,
        }
    }

    /// ブート時やユニットテスト用（何もしない）
    pub fn none() -> TlbScope<'static> {
        TlbScope {
            platform: None,
            cpu: CpuId(0),
            active_root: None,
        }
    }

    pub fn invalidate(&self, space: &AddressSpace, va: VirtAddr) {
        let Some(platform) = self.platform else {
            return;
        };
        if self.active_root.map_or(true, |root| root == space.root) {
            platform.invlpg(self.cpu, va);
        }
    }
}

/// ページディレクトリのフレームを指すハンドル。
/// フレームの所有（参照数）は env / kernel 側が管理する。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
    pub kind: AddressSpaceKind,
    root: PhysFrame,
}

impl AddressSpace {
    /// 空のページディレクトリを 1 枚確保する（参照数 1）。
    pub fn new_user(pmm: &mut PhysicalMemoryManager) -> Result<AddressSpace, MapError> {
        let root = pmm.allocate(true).ok_or(MapError::NoMem)?;
        pmm.incref(root);
        Ok(AddressSpace {
            kind: AddressSpaceKind::User,
            root,
        })
    }

    /// 既に用意されたディレクトリ（boot_alloc したカーネル用など）を包む。
    pub fn from_root(kind: AddressSpaceKind, root: PhysFrame) -> AddressSpace {
        AddressSpace { kind, root }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn pde(&self, pmm: &PhysicalMemoryManager, pdx: usize) -> Pte {
        self.pde_slot(pdx).read(pmm)
    }

    pub fn set_pde(&self, pmm: &mut PhysicalMemoryManager, pdx: usize, pde: Pte) {
        self.pde_slot(pdx).write(pmm, pde);
    }

    fn pde_slot(&self, pdx: usize) -> PteSlot {
        PteSlot {
            table: self.root,
            index: pdx,
        }
    }

    /// va に対応する PTE の置き場所を返す。
    /// - create == false で PT が無ければ None
    /// - create == true なら PT を 0 埋めで確保し、PDE を P|W|U で張る
    ///   （実際の権限は PTE 側で絞る）。確保できなければ None。
    pub fn walk(
        &self,
        pmm: &mut PhysicalMemoryManager,
        va: VirtAddr,
        create: bool,
    ) -> Option<PteSlot> {
        let pde = self.pde(pmm, va.pdx());
        let table = if pde.is_present() {
            pde.frame()
        } else {
            if !create {
                return None;
            }
            let pt = pmm.allocate(true)?;
            pmm.incref(pt);
            self.set_pde(
                pmm,
                va.pdx(),
                Pte::new(pt, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER),
            );
            pt
        };
        Some(PteSlot {
            table,
            index: va.ptx(),
        })
    }

    /// 読み取り専用の walk（PT を作らない）
    pub fn find_slot(&self, pmm: &PhysicalMemoryManager, va: VirtAddr) -> Option<PteSlot> {
        let pde = self.pde(pmm, va.pdx());
        if !pde.is_present() {
            return None;
        }
        Some(PteSlot {
            table: pde.frame(),
            index: va.ptx(),
        })
    }

    /// va の PTE を読む（PT が無ければ EMPTY）
    pub fn read_pte(&self, pmm: &PhysicalMemoryManager, va: VirtAddr) -> Pte {
        self.find_slot(pmm, va)
            .map(|slot| slot.read(pmm))
            .unwrap_or(Pte::EMPTY)
    }

    /// [va, va+size) を [pa, pa+size) に静的マップする（UTOP より上の固定領域用）。
    /// 参照数は触らない。ページテーブルが取れなければ起動時の致命エラー。
    pub fn map_region(
        &self,
        pmm: &mut PhysicalMemoryManager,
        va: VirtAddr,
        size: u32,
        pa: PhysAddr,
        perm: PteFlags,
    ) {
        assert!(va.is_page_aligned(), "map_region: unaligned va");
        assert!(pa.0 & (PAGE_SIZE - 1) == 0, "map_region: unaligned pa");
        assert!(size % PAGE_SIZE == 0, "map_region: unaligned size");
        if size > 0 && va.0.checked_add(size - 1).is_none() {
            panic!("map_region: range wraps past 4GiB");
        }

        let pages = size / PAGE_SIZE;
        for i in 0..pages {
            let off = i * PAGE_SIZE;
            let cur = VirtAddr(va.0 + off);
            let Some(slot) = self.walk(pmm, cur, true) else {
                panic!("map_region: out of memory for page table");
            };
            slot.write(
                pmm,
                Pte(((pa.0 + off) & !(PAGE_SIZE - 1)) | (perm | PteFlags::PRESENT).bits()),
            );
        }
    }

    /// frame を va に perm|P でマップする。既存マッピングは外す。
    pub fn insert(
        &self,
        pmm: &mut PhysicalMemoryManager,
        tlb: &TlbScope<'_>,
        frame: PhysFrame,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<(), MapError> {
        let slot = self.walk(pmm, va, true).ok_or(MapError::NoMem)?;

        // 同じフレームの入れ直しで一瞬 0 になって解放されないよう、先に上げる
        pmm.incref(frame);
        if slot.read(pmm).is_present() {
            self.remove(pmm, tlb, va);
        }
        slot.write(pmm, Pte::new(frame, perm | PteFlags::PRESENT));
        tlb.invalidate(self, va);
        Ok(())
    }

    /// va にマップされているフレームと、その PTE の置き場所
    pub fn lookup(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtAddr,
    ) -> Option<(PhysFrame, PteSlot)> {
        let slot = self.find_slot(pmm, va)?;
        let pte = slot.read(pmm);
        if !pte.is_present() {
            return None;
        }
        Some((pte.frame(), slot))
    }

    /// va のマッピングを外す（無ければ何もしない）
    pub fn remove(&self, pmm: &mut PhysicalMemoryManager, tlb: &TlbScope<'_>, va: VirtAddr) {
        let Some((frame, slot)) = self.lookup(pmm, va) else {
            return;
        };
        pmm.decref(frame);
        slot.write(pmm, Pte::EMPTY);
        tlb.invalidate(self, va);
    }

    /// [va, va+len) の各ページが perm|P を満たし、ULIM より下にあるか。
    /// 失敗したら最初に引っかかったアドレス（先頭ページなら va そのもの）を返す。
    pub fn check_user_access(
        &self,
        pmm: &PhysicalMemoryManager,
        va: VirtAddr,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), VirtAddr> {
        if len == 0 {
            return Ok(());
        }
        let need = perm | PteFlags::PRESENT;
        let start = va.align_down().0 as u64;
        let end = (va.0 as u64 + len as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        let mut cur = start;
        while cur < end {
            let bad = VirtAddr(if cur < va.0 as u64 { va.0 } else { cur as u32 });
            if cur >= ULIM as u64 {
                return Err(bad);
            }
            let page = VirtAddr(cur as u32);
            let pde = self.pde(pmm, page.pdx());
            if !pde.flags().contains(need) {
                return Err(bad);
            }
            let pte = self.read_pte(pmm, page);
            if !pte.flags().contains(need) {
                return Err(bad);
            }
            cur += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// UTOP 未満のマッピングと、そこで使っていたページテーブルをすべて解放する。
    /// ディレクトリ自体のフレームは呼び出し側が decref する。
    pub fn teardown_user(&self, pmm: &mut PhysicalMemoryManager, tlb: &TlbScope<'_>) {
        let user_pdes = VirtAddr(UTOP).pdx();
        for pdx in 0..user_pdes {
            let pde = self.pde(pmm, pdx);
            if !pde.is_present() {
                continue;
            }
            let pt = pde.frame();
            for ptx in 0..ENTRIES_PER_TABLE {
                let slot = PteSlot { table: pt, index: ptx };
                if slot.read(pmm).is_present() {
                    self.remove(pmm, tlb, VirtAddr::from_indices(pdx, ptx));
                }
            }
            self.set_pde(pmm, pdx, Pte::EMPTY);
            pmm.decref(pt);
        }
    }

    /// ソフトウェア MMU。成功すれば物理アドレス、失敗すればフォルトのエラーコード。
    /// - 両レベルで P を見る（欠けていれば not-present fault）
    /// - user なら両レベルで U、write なら両レベルで W（CR0.WP 相当でカーネルにも適用）
    pub fn translate(
        &self,
        pmm: &mut PhysicalMemoryManager,
        va: VirtAddr,
        access: Access,
    ) -> Result<PhysAddr, PageFaultErrorCode> {
        let mut code = PageFaultErrorCode::empty();
        if access.write {
            code |= PageFaultErrorCode::CAUSED_BY_WRITE;
        }
        if access.user {
            code |= PageFaultErrorCode::USER_MODE;
        }

        let mut need = PteFlags::empty();
        if access.write {
            need |= PteFlags::WRITABLE;
        }
        if access.user {
            need |= PteFlags::USER;
        }

        let pde_slot = self.pde_slot(va.pdx());
        let pde = pde_slot.read(pmm);
        if !pde.is_present() {
            return Err(code);
        }
        let slot = PteSlot {
            table: pde.frame(),
            index: va.ptx(),
        };
        let pte = slot.read(pmm);
        if !pte.is_present() {
            return Err(code);
        }
        if !pde.flags().contains(need) || !pte.flags().contains(need) {
            return Err(code | PageFaultErrorCode::PROTECTION_VIOLATION);
        }

        pde_slot.write(pmm, pde.with_flags(pde.flags() | PteFlags::ACCESSED));
        let mut set = pte.flags() | PteFlags::ACCESSED;
        if access.write {
            set |= PteFlags::DIRTY;
        }
        // 自己マップ経由だと PDE と PTE が同じ場所になりうるので読み直す
        let pte = slot.read(pmm);
        slot.write(pmm, pte.with_flags(pte.flags() | set));

        Ok(PhysAddr(pte.addr().0 + va.page_offset() as u32))
    }

    /// カーネルがこの空間の仮想アドレスへ書き込む（upcall フレーム / ELF ロード用）。
    /// 途中のページで失敗したら、そのアドレスを返す。
    pub fn copy_to(
        &self,
        pmm: &mut PhysicalMemoryManager,
        va: VirtAddr,
        data: &[u8],
        access: Access,
    ) -> Result<(), VirtAddr> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va.checked_add(done as u32).ok_or(VirtAddr(u32::MAX))?;
            let chunk = core::cmp::min(PAGE_SIZE as usize - cur.page_offset(), data.len() - done);
            let pa = self.translate(pmm, cur, access).map_err(|_| cur)?;
            pmm.write_phys(pa, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// この空間の仮想アドレスから読み出す。
    pub fn copy_from(
        &self,
        pmm: &mut PhysicalMemoryManager,
        va: VirtAddr,
        buf: &mut [u8],
        access: Access,
    ) -> Result<(), VirtAddr> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va.checked_add(done as u32).ok_or(VirtAddr(u32::MAX))?;
            let chunk = core::cmp::min(PAGE_SIZE as usize - cur.page_offset(), buf.len() - done);
            let pa = self.translate(pmm, cur, access).map_err(|_| cur)?;
            pmm.read_phys(pa, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// [0, limit) の present な PTE を順に渡す（fork と不変条件チェック用）
    pub fn for_each_mapping<F>(&self, pmm: &PhysicalMemoryManager, limit: VirtAddr, mut f: F)
    where
        F: FnMut(VirtAddr, Pte),
    {
        let last_pdx = if limit.0 == 0 {
            return;
        } else {
            VirtAddr(limit.0 - 1).pdx()
        };
        for pdx in 0..=last_pdx {
            let pde = self.pde(pmm, pdx);
            if !pde.is_present() {
                continue;
            }
            for ptx in 0..ENTRIES_PER_TABLE {
                let va = VirtAddr::from_indices(pdx, ptx);
                if va.0 >= limit.0 {
                    return;
                }
                let pte = PteSlot {
                    table: pde.frame(),
                    index: ptx,
                }
                .read(pmm);
                if pte.is_present() {
                    f(va, pte);
                }
            }
        }
    }

    /// UTOP 未満のマッピング数
    pub fn mapping_count(&self, pmm: &PhysicalMemoryManager) -> usize {
        let mut n = 0;
        self.for_each_mapping(pmm, VirtAddr(UTOP), |_, _| n += 1);
        n
    }
}
