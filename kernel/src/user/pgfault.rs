// kernel/src/user/pgfault.rs
//
// set_pgfault_handler(): ユーザレベルのページフォルト処理を登録する。
// - 初回だけ例外スタック（UXSTACKTOP の下 1 page）を確保し、upcall を PFENTRY に向ける
// - ハンドラ本体は env ごとのランタイムに置く（_pgfault_handler 相当）
//
// PFENTRY から先（ハンドラ呼び出しと trap-time 状態への復帰）は machine が行う。

use crate::kernel::EnvId;
use crate::machine::{PgfaultHandler, UserContext, UserError};
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::layout::UXSTACKTOP;
use crate::mem::paging::PteFlags;

use super::syscall::{sys_env_set_pgfault_upcall, sys_page_alloc};

/// アセンブリの upcall 入口（_pgfault_upcall）に相当するアドレス
pub const PFENTRY: u32 = 0x0080_0020;

pub fn set_pgfault_handler(ctx: &mut UserContext<'_>, handler: PgfaultHandler) -> Result<(), UserError> {
    if ctx.pgfault_handler().is_none() {
        let perm = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE;
        sys_page_alloc(ctx, EnvId::NONE, VirtAddr(UXSTACKTOP - PAGE_SIZE), perm)?;
        sys_env_set_pgfault_upcall(ctx, EnvId::NONE, VirtAddr(PFENTRY))?;
    }
    ctx.set_pgfault_handler_fn(handler);
    Ok(())
}
