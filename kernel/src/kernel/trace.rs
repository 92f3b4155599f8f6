// kernel/src/kernel/trace.rs
//
// feature で有効にする軽量 trace。
// - ipc_trace_syscall: sys_ipc_try_send / sys_ipc_recv の入口
// - ipc_trace_paths:   IPC の結果（配送 / 拒否 / ブロック）。ipc_trace_syscall を内包
// - sched_trace:       sched_yield が選んだ env
//
// feature off のときは空の inline 関数になる。呼び出し側に cfg は書かない。
// 出力は logging の info 系だけ。ヒープは使わない。

use super::EnvId;
use crate::types::CpuId;

#[derive(Clone, Copy)]
pub enum IpcPathEvent {
    Delivered,
    DeliveredWithPage,
    NotRecv,
    // 送り手はページを付けたが受け手が要らなかった
    PageDropped,
    RecvBlocked,
}

impl IpcPathEvent {
    #[cfg_attr(not(feature = "ipc_trace_paths"), allow(dead_code))]
    fn label(self) -> &'static str {
        match self {
            IpcPathEvent::Delivered => "ipc path send=delivered",
            IpcPathEvent::DeliveredWithPage => "ipc path send=delivered_page",
            IpcPathEvent::NotRecv => "ipc path send=not_recv",
            IpcPathEvent::PageDropped => "ipc path send=page_dropped",
            IpcPathEvent::RecvBlocked => "ipc path recv=blocked",
        }
    }
}

#[inline(always)]
pub fn trace_ipc_syscall_try_send(from: EnvId, to: EnvId, value: u32) {
    #[cfg(feature = "ipc_trace_syscall")]
    {
        crate::logging::info("ipc syscall=try_send");
        crate::logging::info_hex(" from", from.raw());
        crate::logging::info_hex(" to", to.raw());
        crate::logging::info_hex(" value", value);
    }
    #[cfg(not(feature = "ipc_trace_syscall"))]
    let _ = (from, to, value);
}

#[inline(always)]
pub fn trace_ipc_syscall_recv(env: EnvId) {
    #[cfg(feature = "ipc_trace_syscall")]
    {
        crate::logging::info("ipc syscall=recv");
        crate::logging::info_hex(" env", env.raw());
    }
    #[cfg(not(feature = "ipc_trace_syscall"))]
    let _ = env;
}

#[inline(always)]
pub fn trace_ipc_path(ev: IpcPathEvent) {
    #[cfg(feature = "ipc_trace_paths")]
    crate::logging::info(ev.label());
    #[cfg(not(feature = "ipc_trace_paths"))]
    let _ = ev;
}

#[inline(always)]
pub fn trace_sched_pick(cpu: CpuId, env: EnvId, slot: usize) {
    #[cfg(feature = "sched_trace")]
    {
        crate::logging::info("sched pick");
        crate::logging::info_u64(" cpu", cpu.0 as u64);
        crate::logging::info_hex(" env", env.raw());
        crate::logging::info_u64(" slot", slot as u64);
    }
    #[cfg(not(feature = "sched_trace"))]
    let _ = (cpu, env, slot);
}
