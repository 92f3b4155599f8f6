// kernel/src/kernel/syscall.rs
//
// syscall 境界
// - eax = 番号、edx / ecx / ebx / edi / esi = 引数 1..5
// - 戻り値は 0 以上なら成功（envid や文字など）、負なら -E_*
// - 検証に失敗したら何も変えずに負のコードを返す
//
// トレース（feature で切替）
// - ipc_trace_syscall: ipc_try_send / ipc_recv の入口を出す
//
// 設計方針:
// - レジスタの解釈は Syscall::decode に 1 箇所で閉じ込める（ユーザ側は args() で同じ形に戻す）
// - 実処理は Result<u32, KernelError> で書き、負のコードへの変換は syscall() だけがやる

use alloc::vec;

use super::env::UpcallEntry;
use super::trace::{trace_ipc_syscall_recv, trace_ipc_syscall_try_send};
use super::{EnvId, EnvStatus, KernelError, KernelState, LogEvent};
use crate::arch::trapframe::{Trapframe, FL_IF, FL_IOPL_MASK, TRAPFRAME_SIZE};
use crate::mem::addr::VirtAddr;
use crate::mem::address_space::Access;
use crate::mem::layout::UTOP;
use crate::mem::paging::{MemAction, PteFlags};

pub const SYS_CPUTS: u32 = 0;
pub const SYS_CGETC: u32 = 1;
pub const SYS_GETENVID: u32 = 2;
pub const SYS_ENV_DESTROY: u32 = 3;
pub const SYS_PAGE_ALLOC: u32 = 4;
pub const SYS_PAGE_MAP: u32 = 5;
pub const SYS_PAGE_UNMAP: u32 = 6;
pub const SYS_EXOFORK: u32 = 7;
pub const SYS_ENV_SET_STATUS: u32 = 8;
pub const SYS_ENV_SET_TRAPFRAME: u32 = 9;
pub const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 10;
pub const SYS_YIELD: u32 = 11;
pub const SYS_IPC_TRY_SEND: u32 = 12;
pub const SYS_IPC_RECV: u32 = 13;
pub const SYS_FORK: u32 = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    Cputs { s: VirtAddr, len: u32 },
    Cgetc,
    GetEnvId,
    EnvDestroy { env: EnvId },
    PageAlloc { env: EnvId, va: VirtAddr, perm: u32 },
    PageMap { src_env: EnvId, src_va: VirtAddr, dst_env: EnvId, dst_va: VirtAddr, perm: u32 },
    PageUnmap { env: EnvId, va: VirtAddr },
    Exofork,
    EnvSetStatus { env: EnvId, status: u32 },
    EnvSetTrapframe { env: EnvId, tf: VirtAddr },
    EnvSetPgfaultUpcall { env: EnvId, func: VirtAddr },
    Yield,
    IpcTrySend { env: EnvId, value: u32, src_va: VirtAddr, perm: u32 },
    IpcRecv { dst_va: VirtAddr },
    Fork,
}

impl Syscall {
    /// レジスタから組み立てる。未知の番号なら None。
    pub fn decode(num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> Option<Syscall> {
        let env = |v: u32| EnvId(v as i32);
        Some(match num {
            SYS_CPUTS => Syscall::Cputs { s: VirtAddr(a1), len: a2 },
            SYS_CGETC => Syscall::Cgetc,
            SYS_GETENVID => Syscall::GetEnvId,
            SYS_ENV_DESTROY => Syscall::EnvDestroy { env: env(a1) },
            SYS_PAGE_ALLOC => Syscall::PageAlloc { env: env(a1), va: VirtAddr(a2), perm: a3 },
            SYS_PAGE_MAP => Syscall::PageMap {
                src_env: env(a1),
                src_va: VirtAddr(a2),
                dst_env: env(a3),
                dst_va: VirtAddr(a4),
                perm: a5,
            },
            SYS_PAGE_UNMAP => Syscall::PageUnmap { env: env(a1), va: VirtAddr(a2) },
            SYS_EXOFORK => Syscall::Exofork,
            SYS_ENV_SET_STATUS => Syscall::EnvSetStatus { env: env(a1), status: a2 },
            SYS_ENV_SET_TRAPFRAME => Syscall::EnvSetTrapframe { env: env(a1), tf: VirtAddr(a2) },
            SYS_ENV_SET_PGFAULT_UPCALL => {
                Syscall::EnvSetPgfaultUpcall { env: env(a1), func: VirtAddr(a2) }
            }
            SYS_YIELD => Syscall::Yield,
            SYS_IPC_TRY_SEND => Syscall::IpcTrySend {
                env: env(a1),
                value: a2,
                src_va: VirtAddr(a3),
                perm: a4,
            },
            SYS_IPC_RECV => Syscall::IpcRecv { dst_va: VirtAddr(a1) },
            SYS_FORK => Syscall::Fork,
            _ => return None,
        })
    }

    pub fn number(&self) -> u32 {
        match self {
            Syscall::Cputs { .. } => SYS_CPUTS,
            Syscall::Cgetc => SYS_CGETC,
            Syscall::GetEnvId => SYS_GETENVID,
            Syscall::EnvDestroy { .. } => SYS_ENV_DESTROY,
            Syscall::PageAlloc { .. } => SYS_PAGE_ALLOC,
            Syscall::PageMap { .. } => SYS_PAGE_MAP,
            Syscall::PageUnmap { .. } => SYS_PAGE_UNMAP,
            Syscall::Exofork => SYS_EXOFORK,
            Syscall::EnvSetStatus { .. } => SYS_ENV_SET_STATUS,
            Syscall::EnvSetTrapframe { .. } => SYS_ENV_SET_TRAPFRAME,
            Syscall::EnvSetPgfaultUpcall { .. } => SYS_ENV_SET_PGFAULT_UPCALL,
            Syscall::Yield => SYS_YIELD,
            Syscall::IpcTrySend { .. } => SYS_IPC_TRY_SEND,
            Syscall::IpcRecv { .. } => SYS_IPC_RECV,
            Syscall::Fork => SYS_FORK,
        }
    }

    /// レジスタ a1..a5（edx, ecx, ebx, edi, esi）に戻す
    pub fn args(&self) -> [u32; 5] {
        match *self {
            Syscall::Cputs { s, len } => [s.0, len, 0, 0, 0],
            Syscall::Cgetc | Syscall::GetEnvId | Syscall::Exofork | Syscall::Yield | Syscall::Fork => {
                [0; 5]
            }
            Syscall::EnvDestroy { env } => [env.raw(), 0, 0, 0, 0],
            Syscall::PageAlloc { env, va, perm } => [env.raw(), va.0, perm, 0, 0],
            Syscall::PageMap { src_env, src_va, dst_env, dst_va, perm } => {
                [src_env.raw(), src_va.0, dst_env.raw(), dst_va.0, perm]
            }
            Syscall::PageUnmap { env, va } => [env.raw(), va.0, 0, 0, 0],
            Syscall::EnvSetStatus { env, status } => [env.raw(), status, 0, 0, 0],
            Syscall::EnvSetTrapframe { env, tf } => [env.raw(), tf.0, 0, 0, 0],
            Syscall::EnvSetPgfaultUpcall { env, func } => [env.raw(), func.0, 0, 0, 0],
            Syscall::IpcTrySend { env, value, src_va, perm } => {
                [env.raw(), value, src_va.0, perm, 0]
            }
            Syscall::IpcRecv { dst_va } => [dst_va.0, 0, 0, 0, 0],
        }
    }
}

/// ユーザが指定した perm: U|P 必須、PTE_SYSCALL 以外のビットは不可。
/// COW と W は同時に立てられない。
pub(super) fn check_syscall_perm(perm: u32) -> Result<PteFlags, KernelError> {
    let flags = PteFlags::from_bits(perm).ok_or(KernelError::Inval)?;
    if !flags.contains(PteFlags::USER | PteFlags::PRESENT) || !PteFlags::SYSCALL.contains(flags) {
        return Err(KernelError::Inval);
    }
    if flags.contains(PteFlags::COW | PteFlags::WRITABLE) {
        return Err(KernelError::Inval);
    }
    Ok(flags)
}

/// UTOP 未満かつページ境界
pub(super) fn check_user_va(va: VirtAddr) -> Result<(), KernelError> {
    if va.0 >= UTOP || !va.is_page_aligned() {
        return Err(KernelError::Inval);
    }
    Ok(())
}

impl KernelState {
    //
    // syscall(): trap_dispatch から呼ばれる
    //
    pub fn syscall(&mut self, num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
        self.counters.syscalls += 1;
        let Some(env) = self.curenv_id() else {
            return KernelError::BadEnv.code();
        };

        let ret = match Syscall::decode(num, a1, a2, a3, a4, a5) {
            Some(sc) => match self.handle_syscall(sc) {
                Ok(v) => v as i32,
                Err(e) => e.code(),
            },
            None => KernelError::Inval.code(),
        };

        self.push_event(LogEvent::SyscallHandled { env, num, ret });
        ret
    }

    fn handle_syscall(&mut self, sc: Syscall) -> Result<u32, KernelError> {
        let cur = self.curenv().ok_or(KernelError::BadEnv)?;
        let cur_id = self.envs[cur].id;

        match sc {
            Syscall::Cputs { s, len } => {
                self.user_mem_assert(cur, s, len, PteFlags::USER)?;
                let mut buf = vec![0u8; len as usize];
                let space = self.space_of(cur);
                space
                    .copy_from(&mut self.pmm, s, &mut buf, Access::USER_READ)
                    .map_err(|_| KernelError::Fault)?;
                self.console.puts(&buf);
                Ok(0)
            }

            Syscall::Cgetc => Ok(self.console.getc().map_or(0, |c| c as u32)),

            Syscall::GetEnvId => Ok(cur_id.raw()),

            Syscall::EnvDestroy { env } => {
                let idx = self.envid2env(env, true)?;
                let target = self.envs[idx].id;
                if target == cur_id {
                    cprintf!(self, "[{}] exiting gracefully\n", cur_id);
                } else {
                    cprintf!(self, "[{}] destroying {}\n", cur_id, target);
                }
                self.env_destroy(idx);
                Ok(0)
            }

            Syscall::PageAlloc { env, va, perm } => {
                let idx = self.envid2env(env, true)?;
                check_user_va(va)?;
                let perm = check_syscall_perm(perm)?;

                let frame = self.pmm.allocate(true).ok_or(KernelError::NoMem)?;
                let space = self.space_of(idx);
                let r = self.with_vm(|pmm, tlb| space.insert(pmm, tlb, frame, va, perm));
                if let Err(e) = r {
                    self.pmm.release(frame);
                    return Err(e.into());
                }

                let target = self.envs[idx].id;
                self.push_event(LogEvent::MemActionApplied {
                    env: target,
                    action: MemAction::Map {
                        page: va.page(),
                        frame,
                        flags: perm,
                    },
                });
                Ok(0)
            }

            Syscall::PageMap { src_env, src_va, dst_env, dst_va, perm } => {
                let src = self.envid2env(src_env, true)?;
                let dst = self.envid2env(dst_env, true)?;
                check_user_va(src_va)?;
                check_user_va(dst_va)?;
                let perm = check_syscall_perm(perm)?;

                let src_space = self.space_of(src);
                let (frame, slot) = src_space.lookup(&self.pmm, src_va).ok_or(KernelError::Inval)?;
                if perm.contains(PteFlags::WRITABLE)
                    && !slot.read(&self.pmm).flags().contains(PteFlags::WRITABLE)
                {
                    return Err(KernelError::Inval);
                }

                let dst_space = self.space_of(dst);
                self.with_vm(|pmm, tlb| dst_space.insert(pmm, tlb, frame, dst_va, perm))?;

                let target = self.envs[dst].id;
                self.push_event(LogEvent::MemActionApplied {
                    env: target,
                    action: MemAction::Map {
                        page: dst_va.page(),
                        frame,
                        flags: perm,
                    },
                });
                Ok(0)
            }

            Syscall::PageUnmap { env, va } => {
                let idx = self.envid2env(env, true)?;
                check_user_va(va)?;
                let space = self.space_of(idx);
                self.with_vm(|pmm, tlb| space.remove(pmm, tlb, va));

                let target = self.envs[idx].id;
                self.push_event(LogEvent::MemActionApplied {
                    env: target,
                    action: MemAction::Unmap { page: va.page() },
                });
                Ok(0)
            }

            Syscall::Exofork => {
                let child = self.env_alloc(cur_id)?;
                self.envs[child].tf = self.envs[cur].tf;
                // 子から見た sys_exofork の戻り値
                self.envs[child].tf.regs.eax = 0;
                self.set_status(child, EnvStatus::NotRunnable);
                Ok(self.envs[child].id.raw())
            }

            Syscall::EnvSetStatus { env, status } => {
                let status = match EnvStatus::from_u32(status) {
                    Some(s @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => s,
                    _ => return Err(KernelError::Inval),
                };
                let idx = self.envid2env(env, true)?;
                self.set_status(idx, status);
                Ok(0)
            }

            Syscall::EnvSetTrapframe { env, tf } => {
                let idx = self.envid2env(env, true)?;
                self.user_mem_assert(cur, tf, TRAPFRAME_SIZE as u32, PteFlags::USER)?;

                let mut raw = [0u8; TRAPFRAME_SIZE];
                let space = self.space_of(cur);
                space
                    .copy_from(&mut self.pmm, tf, &mut raw, Access::USER_READ)
                    .map_err(|_| KernelError::Fault)?;

                let mut frame = Trapframe::from_bytes(&raw);
                // ユーザモード・割り込み有効・IOPL 0 に強制する
                frame.cs |= 3;
                frame.eflags |= FL_IF;
                frame.eflags &= !FL_IOPL_MASK;
                self.envs[idx].tf = frame;
                Ok(0)
            }

            Syscall::EnvSetPgfaultUpcall { env, func } => {
                let idx = self.envid2env(env, true)?;
                self.envs[idx].pgfault_upcall = if func.0 == 0 {
                    None
                } else {
                    Some(UpcallEntry(func))
                };
                Ok(0)
            }

            Syscall::Yield => {
                self.yield_requested = true;
                Ok(0)
            }

            Syscall::IpcTrySend { env, value, src_va, perm } => {
                trace_ipc_syscall_try_send(cur_id, env, value);
                self.ipc_try_send(env, value, src_va, perm)
            }

            Syscall::IpcRecv { dst_va } => {
                trace_ipc_syscall_recv(cur_id);
                self.ipc_recv(dst_va)
            }

            Syscall::Fork => {
                let child = self.fork_cow(cur)?;
                Ok(child.raw())
            }
        }
    }
}
