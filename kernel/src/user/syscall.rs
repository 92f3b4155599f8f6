// kernel/src/user/syscall.rs
//
// syscall スタブ。引数を Syscall に詰めて UserContext::syscall に渡し、
// 負の戻り値を KernelError に戻す。

use crate::kernel::{EnvId, EnvStatus, KernelError, Syscall};
use crate::machine::{UserContext, UserError};
use crate::mem::addr::VirtAddr;
use crate::mem::paging::PteFlags;

// puts が 1 回の sys_cputs で送る最大長（スタックの下に置く）
const PUTS_CHUNK: usize = 256;

fn check(ret: i32) -> Result<u32, UserError> {
    if ret < 0 {
        let e = KernelError::from_code(ret).unwrap_or(KernelError::Unspecified);
        return Err(UserError::Kernel(e));
    }
    Ok(ret as u32)
}

fn call(ctx: &mut UserContext<'_>, sc: Syscall) -> Result<u32, UserError> {
    let ret = ctx.syscall(sc)?;
    check(ret)
}

pub fn sys_cputs(ctx: &mut UserContext<'_>, s: VirtAddr, len: u32) -> Result<(), UserError> {
    call(ctx, Syscall::Cputs { s, len }).map(|_| ())
}

/// 入力が無ければ 0
pub fn sys_cgetc(ctx: &mut UserContext<'_>) -> Result<u8, UserError> {
    call(ctx, Syscall::Cgetc).map(|c| c as u8)
}

pub fn sys_getenvid(ctx: &mut UserContext<'_>) -> Result<EnvId, UserError> {
    call(ctx, Syscall::GetEnvId).map(|v| EnvId(v as i32))
}

pub fn sys_env_destroy(ctx: &mut UserContext<'_>, env: EnvId) -> Result<(), UserError> {
    call(ctx, Syscall::EnvDestroy { env }).map(|_| ())
}

pub fn sys_page_alloc(
    ctx: &mut UserContext<'_>,
    env: EnvId,
    va: VirtAddr,
    perm: PteFlags,
) -> Result<(), UserError> {
    call(ctx, Syscall::PageAlloc { env, va, perm: perm.bits() }).map(|_| ())
}

pub fn sys_page_map(
    ctx: &mut UserContext<'_>,
    src_env: EnvId,
    src_va: VirtAddr,
    dst_env: EnvId,
    dst_va: VirtAddr,
    perm: PteFlags,
) -> Result<(), UserError> {
    let sc = Syscall::PageMap {
        src_env,
        src_va,
        dst_env,
        dst_va,
        perm: perm.bits(),
    };
    call(ctx, sc).map(|_| ())
}

pub fn sys_page_unmap(ctx: &mut UserContext<'_>, env: EnvId, va: VirtAddr) -> Result<(), UserError> {
    call(ctx, Syscall::PageUnmap { env, va }).map(|_| ())
}

/// 親には子の id が返る。子は自分のプログラムとして別に走るので、ここには戻ってこない。
pub fn sys_exofork(ctx: &mut UserContext<'_>) -> Result<EnvId, UserError> {
    call(ctx, Syscall::Exofork).map(|v| EnvId(v as i32))
}

pub fn sys_env_set_status(
    ctx: &mut UserContext<'_>,
    env: EnvId,
    status: EnvStatus,
) -> Result<(), UserError> {
    call(ctx, Syscall::EnvSetStatus { env, status: status as u32 }).map(|_| ())
}

/// tf は自分の空間に置いた 68 byte の Trapframe
pub fn sys_env_set_trapframe(
    ctx: &mut UserContext<'_>,
    env: EnvId,
    tf: VirtAddr,
) -> Result<(), UserError> {
    call(ctx, Syscall::EnvSetTrapframe { env, tf }).map(|_| ())
}

pub fn sys_env_set_pgfault_upcall(
    ctx: &mut UserContext<'_>,
    env: EnvId,
    func: VirtAddr,
) -> Result<(), UserError> {
    call(ctx, Syscall::EnvSetPgfaultUpcall { env, func }).map(|_| ())
}

pub fn sys_yield(ctx: &mut UserContext<'_>) -> Result<(), UserError> {
    call(ctx, Syscall::Yield).map(|_| ())
}

pub fn sys_ipc_try_send(
    ctx: &mut UserContext<'_>,
    env: EnvId,
    value: u32,
    src_va: VirtAddr,
    perm: PteFlags,
) -> Result<(), UserError> {
    let sc = Syscall::IpcTrySend {
        env,
        value,
        src_va,
        perm: perm.bits(),
    };
    call(ctx, sc).map(|_| ())
}

pub fn sys_ipc_recv(ctx: &mut UserContext<'_>, dst_va: VirtAddr) -> Result<(), UserError> {
    call(ctx, Syscall::IpcRecv { dst_va }).map(|_| ())
}

/// カーネル側 COW fork
pub fn sys_fork(ctx: &mut UserContext<'_>) -> Result<EnvId, UserError> {
    call(ctx, Syscall::Fork).map(|v| EnvId(v as i32))
}

/// 文字列を自分のスタックの下に書いて sys_cputs する
pub fn puts(ctx: &mut UserContext<'_>, s: &str) -> Result<(), UserError> {
    for chunk in s.as_bytes().chunks(PUTS_CHUNK) {
        let esp = ctx.live_context()?.esp;
        let buf = VirtAddr(esp.wrapping_sub(chunk.len() as u32) & !3);
        ctx.store_bytes(buf, chunk)?;
        sys_cputs(ctx, buf, chunk.len() as u32)?;
    }
    Ok(())
}

/// 自分を破棄する。成功すれば Err(Destroyed) が返る。
pub fn exit(ctx: &mut UserContext<'_>) -> Result<(), UserError> {
    sys_env_destroy(ctx, EnvId::NONE)
}
