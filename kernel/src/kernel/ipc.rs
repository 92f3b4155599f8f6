// kernel/src/kernel/ipc.rs
//
// IPC（値 1 つ + ページ 1 枚まで）
// - 受け手は ipc_recv で NOT_RUNNABLE になって待つ（scheduler に戻る）。
// - 送り手は決してブロックしない。受け手が待っていなければ IpcNotRecv を返し、
//   ユーザライブラリが sys_yield しながら再試行する。
//
// 設計メモ:
// - 検証は受け手の状態を変える前に全部済ませる（失敗したら何も起きていない）。
// - ページを渡すのは「送り手が srcva < UTOP を指定」かつ「受け手が dstva < UTOP で待っている」ときだけ。
//   どちらか片方なら値だけ届き、受け手の perm は 0 になる。
// - W を付けて渡せるのは、送り手側でも W なページだけ。
//
// counters:
// - ipc_sent / ipc_page_sent / ipc_not_recv / ipc_recv_blocked（ログ量は増やさない）

use super::syscall::check_syscall_perm;
use super::trace::{trace_ipc_path, IpcPathEvent};
use super::{EnvId, EnvStatus, KernelError, KernelState, LogEvent};
use crate::mem::addr::VirtAddr;
use crate::mem::layout::UTOP;
use crate::mem::paging::PteFlags;

impl KernelState {
    //
    // ipc_try_send()
    //
    pub(super) fn ipc_try_send(
        &mut self,
        to: EnvId,
        value: u32,
        src_va: VirtAddr,
        perm: u32,
    ) -> Result<u32, KernelError> {
        let cur = self.curenv().ok_or(KernelError::BadEnv)?;
        let from = self.envs[cur].id;
        // 送り先に親子関係は要らない
        let dst = self.envid2env(to, false)?;

        if !self.envs[dst].ipc.recving {
            self.counters.ipc_not_recv += 1;
            trace_ipc_path(IpcPathEvent::NotRecv);
            return Err(KernelError::IpcNotRecv);
        }

        let mut granted = PteFlags::empty();
        if src_va.0 < UTOP {
            if !src_va.is_page_aligned() {
                return Err(KernelError::Inval);
            }
            let flags = check_syscall_perm(perm)?;

            let src_space = self.space_of(cur);
            let (frame, slot) = src_space.lookup(&self.pmm, src_va).ok_or(KernelError::Inval)?;
            if flags.contains(PteFlags::WRITABLE)
                && !slot.read(&self.pmm).flags().contains(PteFlags::WRITABLE)
            {
                return Err(KernelError::Inval);
            }

            let dst_va = self.envs[dst].ipc.dstva;
            if dst_va.0 < UTOP {
                let dst_space = self.space_of(dst);
                self.with_vm(|pmm, tlb| dst_space.insert(pmm, tlb, frame, dst_va, flags))?;
                granted = flags;
            } else {
                trace_ipc_path(IpcPathEvent::PageDropped);
            }
        }

        let e = &mut self.envs[dst];
        e.ipc.recving = false;
        e.ipc.from = from;
        e.ipc.value = value;
        e.ipc.perm = granted;
        // 受け手の sys_ipc_recv は 0 を返したことになる
        e.tf.regs.eax = 0;
        let to = e.id;
        self.set_status(dst, EnvStatus::Runnable);

        let page = !granted.is_empty();
        self.counters.ipc_sent += 1;
        if page {
            self.counters.ipc_page_sent += 1;
            trace_ipc_path(IpcPathEvent::DeliveredWithPage);
        } else {
            trace_ipc_path(IpcPathEvent::Delivered);
        }
        self.push_event(LogEvent::IpcDelivered {
            from,
            to,
            value,
            page,
        });
        Ok(0)
    }

    //
    // ipc_recv(): 待ち状態に入る（trap 側で sched_yield される）
    //
    pub(super) fn ipc_recv(&mut self, dst_va: VirtAddr) -> Result<u32, KernelError> {
        if dst_va.0 < UTOP && !dst_va.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let cur = self.curenv().ok_or(KernelError::BadEnv)?;

        let e = &mut self.envs[cur];
        e.ipc.recving = true;
        e.ipc.dstva = dst_va;
        e.ipc.perm = PteFlags::empty();
        self.set_status(cur, EnvStatus::NotRunnable);

        self.counters.ipc_recv_blocked += 1;
        trace_ipc_path(IpcPathEvent::RecvBlocked);
        Ok(0)
    }
}
