// kernel/src/user/mod.rs
//
// ユーザ空間ライブラリ（lib/ 相当）。hosted machine 上の UserProgram から呼ぶ。
// - syscall: syscall スタブ（負の戻り値は UserError::Kernel へ）
// - pgfault: set_pgfault_handler（例外スタックを用意して upcall を PFENTRY に向ける）
// - fork: uvpt を読んで duppage するユーザレベル COW fork
// - ipc: ipc_send（try / yield の繰り返し）と ipc_recv
// - bc: ファイルシステムサーバのブロックキャッシュ（要求時にディスクから読む）
// - image: テストと sim 用の ELF32 イメージ組み立て
//
// ユーザ空間のグローバル変数（thisenv や _pgfault_handler）は、
// カーネル状態のスナップショットと machine の EnvRuntime で代用する。

pub mod bc;
pub mod fork;
pub mod image;
pub mod ipc;
pub mod pgfault;
pub mod syscall;

use crate::mem::addr::VirtAddr;
use crate::mem::layout::UVPT;
use crate::mem::paging::{Pte, PteFlags};
use crate::machine::{UserContext, UserError};

/// uvpd[pdx]: 自分のページディレクトリ（UVPT の自己マップ越し）
pub fn uvpd(ctx: &mut UserContext<'_>, pdx: usize) -> Result<Pte, UserError> {
    let base = UVPT + ((UVPT >> 12) << 2);
    ctx.load_u32(VirtAddr(base + (pdx as u32) * 4)).map(Pte)
}

/// uvpt[pn]: 自分のページテーブル。PDE が無ければ空エントリ。
pub fn uvpt(ctx: &mut UserContext<'_>, pn: u32) -> Result<Pte, UserError> {
    let pdx = (pn >> 10) as usize;
    if !uvpd(ctx, pdx)?.is_present() {
        return Ok(Pte::EMPTY);
    }
    ctx.load_u32(VirtAddr(UVPT + pn * 4)).map(Pte)
}

/// va のページが present か
pub fn va_is_mapped(ctx: &mut UserContext<'_>, va: VirtAddr) -> Result<bool, UserError> {
    Ok(uvpt(ctx, va.page().number)?.is_present())
}

/// va のページが dirty か
pub fn va_is_dirty(ctx: &mut UserContext<'_>, va: VirtAddr) -> Result<bool, UserError> {
    Ok(uvpt(ctx, va.page().number)?.flags().contains(PteFlags::DIRTY))
}
