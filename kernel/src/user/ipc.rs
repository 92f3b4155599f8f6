// kernel/src/user/ipc.rs
//
// ユーザ側 IPC。
// - ipc_send: 受け手が待っていなければ sys_yield して再試行する（成功するまで）
// - ipc_recv は 2 段: ipc_recv_begin で待ちに入り（step はそこで Descheduled で抜ける）、
//   起こされた後の step で ipc_recv_finish が thisenv から結果を読む
// - ページを渡さない / 受け取らないときは UTOP を番兵として使う

use crate::kernel::{EnvId, EnvType, KernelError};
use crate::machine::{UserContext, UserError};
use crate::mem::addr::VirtAddr;
use crate::mem::layout::UTOP;
use crate::mem::paging::PteFlags;

use super::syscall::{sys_ipc_recv, sys_ipc_try_send, sys_yield};

/// 受け取ったメッセージ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcMessage {
    pub from: EnvId,
    pub value: u32,
    /// ページを受け取ったならその権限、受け取らなければ空
    pub perm: PteFlags,
}

pub fn ipc_send(
    ctx: &mut UserContext<'_>,
    to: EnvId,
    value: u32,
    page: Option<VirtAddr>,
    perm: PteFlags,
) -> Result<(), UserError> {
    let src_va = page.unwrap_or(VirtAddr(UTOP));
    loop {
        match sys_ipc_try_send(ctx, to, value, src_va, perm) {
            Ok(()) => return Ok(()),
            Err(UserError::Kernel(KernelError::IpcNotRecv)) => sys_yield(ctx)?,
            Err(UserError::Kernel(_)) => return Err(UserError::Panic("ipc_send: send failed")),
            Err(e) => return Err(e),
        }
    }
}

/// 受信待ちに入る。普通は Err(Descheduled) で返る（待ちに入ったので cpu を手放した）。
pub fn ipc_recv_begin(ctx: &mut UserContext<'_>, page: Option<VirtAddr>) -> Result<(), UserError> {
    let dst_va = page.unwrap_or(VirtAddr(UTOP));
    sys_ipc_recv(ctx, dst_va)
}

/// 起こされた後に、届いたメッセージを読む
pub fn ipc_recv_finish(ctx: &mut UserContext<'_>) -> Result<IpcMessage, UserError> {
    let e = ctx.thisenv()?;
    Ok(IpcMessage {
        from: e.ipc.from,
        value: e.ipc.value,
        perm: e.ipc.perm,
    })
}

/// 指定した種類の最初の env
pub fn ipc_find_env(ctx: &mut UserContext<'_>, env_type: EnvType) -> Option<EnvId> {
    ctx.env_snapshots()
        .into_iter()
        .find(|e| e.env_type == env_type)
        .map(|e| e.id)
}
