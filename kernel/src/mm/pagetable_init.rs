// src/mm/pagetable_init.rs
//
// 役割:
// - カーネルのマスターページディレクトリと、env ごとのページディレクトリを作る。
//
// やること:
// - カーネル: 物理メモリ窓（KERNBASE..）、CPU ごとのカーネルスタック、UVPT 自己マップ
// - env: UTOP 以上をカーネルからコピーし、UVPT だけ自分自身を指す（読み取り専用）
//
// やらないこと:
// - UPAGES / UENVS の読み取り専用公開（ユーザライブラリは syscall 経由で env 情報を得る）
// - MMIO 領域のマップ

use alloc::vec::Vec;

use crate::mem::addr::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::mem::address_space::{AddressSpace, AddressSpaceKind, MapError};
use crate::mem::layout::{kstack_top, KERNBASE, KSTKSIZE, UTOP, UVPT};
use crate::mem::paging::{Pte, PteFlags};
use crate::mm::PhysicalMemoryManager;
use crate::logging;

/// 物理メモリ窓の最大長（4GiB - KERNBASE）
const PHYS_WINDOW_MAX: u64 = (1u64 << 32) - KERNBASE as u64;

/// boot_alloc で確保した「page_init 前の」領域
pub struct BootAllocations {
    pub pgdir: PhysAddr,
    pub kstacks: Vec<PhysAddr>,
}

/// page_init より前に必要な領域を boot_alloc で取る。
pub fn boot_reserve(pmm: &mut PhysicalMemoryManager, ncpu: usize) -> BootAllocations {
    let pgdir = pmm.boot_alloc(PAGE_SIZE);
    let kstacks = (0..ncpu).map(|_| pmm.boot_alloc(KSTKSIZE)).collect();
    BootAllocations { pgdir, kstacks }
}

/// page_init 後に、マスターディレクトリの中身を埋める。
pub fn build_kernel_directory(
    pmm: &mut PhysicalMemoryManager,
    boot: &BootAllocations,
    phys_top: u32,
) -> AddressSpace {
    let root = boot.pgdir.frame();
    pmm.frame_bytes_mut(root).fill(0);
    let kern = AddressSpace::from_root(AddressSpaceKind::Kernel, root);

    // UVPT: 自分自身を読み取り専用で見せる
    kern.set_pde(
        pmm,
        VirtAddr(UVPT).pdx(),
        Pte::new(root, PteFlags::USER | PteFlags::PRESENT),
    );

    for (cpu, stack) in boot.kstacks.iter().enumerate() {
        let top = kstack_top(cpu);
        kern.map_region(
            pmm,
            VirtAddr(top - KSTKSIZE),
            KSTKSIZE,
            *stack,
            PteFlags::WRITABLE,
        );
    }

    let window = core::cmp::min(phys_top as u64, PHYS_WINDOW_MAX) as u32;
    kern.map_region(pmm, VirtAddr(KERNBASE), window, PhysAddr(0), PteFlags::WRITABLE);

    logging::info("pagetable_init: kernel directory ready");
    logging::info_hex(" kern_pgdir", root.start_address().0);
    logging::info_u64(" kernel_pdes", count_present(pmm, &kern) as u64);
    kern
}

/// env 用のディレクトリ（参照数 1）を作る。
/// - UTOP 未満は空
/// - UTOP 以上はカーネルの PDE をそのままコピー
/// - UVPT は新しいディレクトリ自身を P|U で指す
pub fn new_env_directory(
    pmm: &mut PhysicalMemoryManager,
    kern: &AddressSpace,
) -> Result<AddressSpace, MapError> {
    let space = AddressSpace::new_user(pmm)?;
    let first_kernel_pde = VirtAddr(UTOP).pdx();
    for pdx in first_kernel_pde..ENTRIES_PER_TABLE {
        let pde = kern.pde(pmm, pdx);
        space.set_pde(pmm, pdx, pde);
    }
    space.set_pde(
        pmm,
        VirtAddr(UVPT).pdx(),
        Pte::new(space.root(), PteFlags::USER | PteFlags::PRESENT),
    );
    Ok(space)
}

fn count_present(pmm: &PhysicalMemoryManager, space: &AddressSpace) -> usize {
    (0..ENTRIES_PER_TABLE)
        .filter(|&pdx| space.pde(pmm, pdx).is_present())
        .count()
}
