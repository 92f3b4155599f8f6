// kernel/src/user/fork.rs
//
// ユーザレベル copy-on-write fork。
// - 親は sys_exofork で空の子を作り、uvpt を読みながら USTACKTOP 未満のページを duppage する。
// - 子の例外スタックは新しいページを確保し、upcall を設定してから RUNNABLE にする。
// - 書き込みで COW ページにフォルトしたら pgfault が PFTEMP 経由で私有コピーを作る。
//
// [不変条件]
// - duppage は子を先に COW で張り、その後で親を COW に張り直す。

use alloc::boxed::Box;

use crate::arch::trapframe::UTrapframe;
use crate::kernel::{EnvId, EnvStatus};
use crate::machine::{UserContext, UserError, UserProgram};
use crate::mem::addr::{VirtAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::mem::layout::{PFTEMP, USTACKTOP, UXSTACKTOP};
use crate::mem::paging::PteFlags;
use x86_64::structures::idt::PageFaultErrorCode;

use super::pgfault::{set_pgfault_handler, PFENTRY};
use super::syscall::{
    sys_env_set_pgfault_upcall, sys_env_set_status, sys_exofork, sys_page_alloc, sys_page_map,
    sys_page_unmap,
};
use super::{uvpd, uvpt};

/// COW ページへの書き込みフォルト
pub fn pgfault(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = VirtAddr(utf.fault_va).align_down();
    let code = PageFaultErrorCode::from_bits_truncate(utf.err as u64);

    if !code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        return Err(UserError::Panic("pgfault: not a write"));
    }
    if !uvpt(ctx, addr.page().number)?.flags().contains(PteFlags::COW) {
        return Err(UserError::Panic("pgfault: not a copy-on-write page"));
    }

    let rw = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE;
    let tmp = VirtAddr(PFTEMP);
    sys_page_alloc(ctx, EnvId::NONE, tmp, rw)?;

    let mut page = [0u8; PAGE_SIZE as usize];
    ctx.load_bytes(addr, &mut page)?;
    ctx.store_bytes(tmp, &page)?;

    sys_page_map(ctx, EnvId::NONE, tmp, EnvId::NONE, addr, rw)?;
    sys_page_unmap(ctx, EnvId::NONE, tmp)?;
    Ok(())
}

/// ページ pn を子へ写す
fn duppage(ctx: &mut UserContext<'_>, child: EnvId, pn: u32) -> Result<(), UserError> {
    let va = VirtAddr(pn * PAGE_SIZE);
    let flags = uvpt(ctx, pn)?.flags();

    if flags.contains(PteFlags::SHARE) {
        sys_page_map(ctx, EnvId::NONE, va, child, va, flags & PteFlags::SYSCALL)?;
    } else if flags.intersects(PteFlags::WRITABLE | PteFlags::COW) {
        let cow = PteFlags::PRESENT | PteFlags::USER | PteFlags::COW;
        sys_page_map(ctx, EnvId::NONE, va, child, va, cow)?;
        sys_page_map(ctx, EnvId::NONE, va, EnvId::NONE, va, cow)?;
    } else {
        sys_page_map(ctx, EnvId::NONE, va, child, va, PteFlags::PRESENT | PteFlags::USER)?;
    }
    Ok(())
}

/// 子の id を返す。子は child_program を走らせる（fork の戻り値 0 の側）。
pub fn fork(ctx: &mut UserContext<'_>, child_program: Box<dyn UserProgram>) -> Result<EnvId, UserError> {
    set_pgfault_handler(ctx, pgfault)?;

    let child = sys_exofork(ctx)?;
    ctx.adopt(child, child_program);

    let last_pn = USTACKTOP / PAGE_SIZE;
    let per_table = ENTRIES_PER_TABLE as u32;
    let mut pn = 0;
    while pn < last_pn {
        // ページテーブルが無い 4MiB はまとめて飛ばす
        if !uvpd(ctx, (pn / per_table) as usize)?.is_present() {
            pn = (pn / per_table + 1) * per_table;
            continue;
        }
        let pte = uvpt(ctx, pn)?;
        if pte.is_present() && pte.flags().contains(PteFlags::USER) {
            duppage(ctx, child, pn)?;
        }
        pn += 1;
    }

    let rw = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE;
    sys_page_alloc(ctx, child, VirtAddr(UXSTACKTOP - PAGE_SIZE), rw)?;
    sys_env_set_pgfault_upcall(ctx, child, VirtAddr(PFENTRY))?;
    sys_env_set_status(ctx, child, EnvStatus::Runnable)?;
    Ok(child)
}
