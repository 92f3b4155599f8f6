// kernel/src/user/bc.rs
//
// ファイルシステムサーバのブロックキャッシュ。
// - ディスク全体を DISKMAP から仮想的に並べ、触ったブロックだけページフォルトで読み込む
// - flush_block は dirty なブロックだけ書き戻し、PTE_SYSCALL で張り直して D を落とす
//
// ディスクに触れるので IOPL 3 の env（EnvType::Fs）でしか使えない。

use crate::arch::trapframe::UTrapframe;
use crate::dev::ide::SECTSIZE;
use crate::kernel::EnvId;
use crate::machine::{UserContext, UserError};
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::layout::{DISKMAP, DISKSIZE};
use crate::mem::paging::PteFlags;

use super::pgfault::set_pgfault_handler;
use super::syscall::{sys_page_alloc, sys_page_map};
use super::{uvpt, va_is_dirty, va_is_mapped};

pub const BLKSIZE: u32 = PAGE_SIZE;
pub const BLKSECTS: usize = BLKSIZE as usize / SECTSIZE;

/// ブロック番号 → キャッシュ上の仮想アドレス
pub fn diskaddr(blockno: u32) -> Result<VirtAddr, UserError> {
    match blockno.checked_mul(BLKSIZE) {
        Some(off) if off < DISKSIZE => Ok(VirtAddr(DISKMAP + off)),
        _ => Err(UserError::Panic("bad block number")),
    }
}

fn blockno_of(va: VirtAddr) -> u32 {
    (va.0 - DISKMAP) / BLKSIZE
}

fn in_cache(va: VirtAddr) -> bool {
    va.0 >= DISKMAP && (va.0 as u64) < DISKMAP as u64 + DISKSIZE as u64
}

/// D ビットを落とす（同じフレームを PTE_SYSCALL のビットだけで張り直す）
fn clear_dirty(ctx: &mut UserContext<'_>, page: VirtAddr) -> Result<(), UserError> {
    let perm = uvpt(ctx, page.page().number)?.flags() & PteFlags::SYSCALL;
    sys_page_map(ctx, EnvId::NONE, page, EnvId::NONE, page, perm)
}

/// キャッシュ領域のフォルトでブロックを読み込む
pub fn bc_pgfault(ctx: &mut UserContext<'_>, utf: &UTrapframe) -> Result<(), UserError> {
    let addr = VirtAddr(utf.fault_va);
    if !in_cache(addr) {
        return Err(UserError::Panic("page fault in FS outside the block cache"));
    }
    let page = addr.align_down();
    let blockno = blockno_of(page);

    let rw = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE;
    sys_page_alloc(ctx, EnvId::NONE, page, rw)?;

    let mut buf = [0u8; BLKSIZE as usize];
    ctx.ide_read(blockno * BLKSECTS as u32, &mut buf, BLKSECTS)?;
    ctx.store_bytes(page, &buf)?;

    // 読み込みで立った D を消す
    clear_dirty(ctx, page)
}

/// addr を含むブロックが dirty なら書き戻す
pub fn flush_block(ctx: &mut UserContext<'_>, addr: VirtAddr) -> Result<(), UserError> {
    if !in_cache(addr) {
        return Err(UserError::Panic("flush_block of bad va"));
    }
    let page = addr.align_down();
    if !va_is_mapped(ctx, page)? || !va_is_dirty(ctx, page)? {
        return Ok(());
    }

    let mut buf = [0u8; BLKSIZE as usize];
    ctx.load_bytes(page, &mut buf)?;
    ctx.ide_write(blockno_of(page) * BLKSECTS as u32, &buf, BLKSECTS)?;
    clear_dirty(ctx, page)
}

pub fn bc_init(ctx: &mut UserContext<'_>) -> Result<(), UserError> {
    set_pgfault_handler(ctx, bc_pgfault)
}
