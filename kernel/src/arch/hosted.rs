// kernel/src/arch/hosted.rs
//
// 役割:
// - 実機の代わりに Platform を実装するソフトウェア CPU 群。
// - resume されたコンテキストを「いまユーザモードで走っているレジスタ」として保持し、
//   machine 側がそれを読み書きしてユーザ命令を模擬する。
//
// やること:
// - EOI / lcr3 / invlpg / resume / halt を順序付きの PlatformEvent として記録する。
//   （timer の EOI が scheduler より先、などの順序をテストで確かめるため）
//
// やらないこと:
// - 本物の TLB キャッシュ（ページテーブルは毎回歩くので無効化は記録だけ）

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use super::trapframe::Trapframe;
use super::Platform;
use crate::config::MAX_CPUS;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::types::CpuId;

const EVENT_CAP: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    Resume { cpu: CpuId, eip: u32, esp: u32 },
    Halt { cpu: CpuId },
    Eoi { cpu: CpuId },
    Lcr3 { cpu: CpuId, root: PhysAddr },
    Invlpg { cpu: CpuId, va: VirtAddr },
}

#[derive(Clone, Copy)]
struct HostedCpu {
    live: Option<Trapframe>,
    halted: bool,
    cr2: u32,
    cr3: PhysAddr,
}

impl HostedCpu {
    const fn new() -> Self {
        HostedCpu {
            live: None,
            halted: false,
            cr2: 0,
            cr3: PhysAddr(0),
        }
    }
}

struct HostedState {
    cpus: [HostedCpu; MAX_CPUS],
    events: VecDeque<PlatformEvent>,
}

pub struct HostedPlatform {
    inner: Mutex<HostedState>,
}

impl Default for HostedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HostedPlatform {
    pub fn new() -> Self {
        HostedPlatform {
            inner: Mutex::new(HostedState {
                cpus: [HostedCpu::new(); MAX_CPUS],
                events: VecDeque::new(),
            }),
        }
    }

    /// いま cpu 上でユーザモードとして走っているレジスタ
    pub fn live_context(&self, cpu: CpuId) -> Option<Trapframe> {
        self.inner.lock().cpus[cpu.0].live
    }

    /// ユーザ命令（pfentry のレジスタ復帰など）による書き換え
    pub fn set_live_context(&self, cpu: CpuId, tf: Trapframe) {
        self.inner.lock().cpus[cpu.0].live = Some(tf);
    }

    /// trap でカーネルへ入る瞬間に呼ぶ（ユーザコンテキストを手放す）
    pub fn take_live_context(&self, cpu: CpuId) -> Option<Trapframe> {
        self.inner.lock().cpus[cpu.0].live.take()
    }

    pub fn set_cr2(&self, cpu: CpuId, va: u32) {
        self.inner.lock().cpus[cpu.0].cr2 = va;
    }

    pub fn cr3(&self, cpu: CpuId) -> PhysAddr {
        self.inner.lock().cpus[cpu.0].cr3
    }

    pub fn is_halted(&self, cpu: CpuId) -> bool {
        self.inner.lock().cpus[cpu.0].halted
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.inner.lock().events.iter().copied().collect()
    }

    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    fn record(state: &mut HostedState, ev: PlatformEvent) {
        if state.events.len() >= EVENT_CAP {
            state.events.pop_front();
        }
        state.events.push_back(ev);
    }
}

impl Platform for HostedPlatform {
    fn resume(&self, cpu: CpuId, tf: &Trapframe) {
        let mut st = self.inner.lock();
        st.cpus[cpu.0].live = Some(*tf);
        st.cpus[cpu.0].halted = false;
        Self::record(
            &mut st,
            PlatformEvent::Resume {
                cpu,
                eip: tf.eip,
                esp: tf.esp,
            },
        );
    }

    fn halt(&self, cpu: CpuId) {
        let mut st = self.inner.lock();
        st.cpus[cpu.0].live = None;
        st.cpus[cpu.0].halted = true;
        Self::record(&mut st, PlatformEvent::Halt { cpu });
    }

    fn lapic_eoi(&self, cpu: CpuId) {
        let mut st = self.inner.lock();
        Self::record(&mut st, PlatformEvent::Eoi { cpu });
    }

    fn lcr3(&self, cpu: CpuId, root: PhysAddr) {
        let mut st = self.inner.lock();
        st.cpus[cpu.0].cr3 = root;
        Self::record(&mut st, PlatformEvent::Lcr3 { cpu, root });
    }

    fn invlpg(&self, cpu: CpuId, va: VirtAddr) {
        let mut st = self.inner.lock();
        Self::record(&mut st, PlatformEvent::Invlpg { cpu, va });
    }

    fn rcr2(&self, cpu: CpuId) -> u32 {
        self.inner.lock().cpus[cpu.0].cr2
    }
}
