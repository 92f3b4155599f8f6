// kernel/src/kernel/sched.rs
//
// round-robin スケジューラ。
//
// - 直前にこの CPU で走らせた env の次から NENV 個を円環状に探し、最初の Runnable を走らせる。
// - 無ければ、curenv がまだ Running ならそれを続ける。
// - それも無ければ CPU を halt する。系全体に走れる env が 1 つも無ければ monitor に落ちる。
//
// [不変条件]
// - 他の CPU の curenv（Running）は選ばない（Runnable しか拾わない）。

use super::trace::trace_sched_pick;
use super::{CpuStatus, Dispatch, EnvStatus, KernelState, LogEvent, NENV};
use crate::logging;

impl KernelState {
    //
    // sched_yield()
    //
    pub fn sched_yield(&mut self) -> Dispatch {
        let cpu = self.this_cpu;
        let start = match self.cpus[cpu.0].last_run {
            Some(i) => (i + 1) % NENV,
            None => 0,
        };

        for k in 0..NENV {
            let i = (start + k) % NENV;
            if self.envs[i].status == EnvStatus::Runnable {
                trace_sched_pick(cpu, self.envs[i].id, i);
                return self.env_run(i);
            }
        }

        if let Some(cur) = self.curenv() {
            if self.envs[cur].status == EnvStatus::Running {
                trace_sched_pick(cpu, self.envs[cur].id, cur);
                return self.env_run(cur);
            }
        }

        self.sched_halt()
    }

    //
    // sched_halt(): 走らせるものが無い
    //
    fn sched_halt(&mut self) -> Dispatch {
        let cpu = self.this_cpu;

        let any_alive = self.envs.iter().any(|e| {
            matches!(
                e.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        });
        if !any_alive {
            cprintf!(self, "No runnable environments in the system!\n");
            self.monitor(None);
        }

        self.cpus[cpu.0].env = None;
        self.platform.lcr3(cpu, self.kern_pgdir.root().start_address());
        self.cpus[cpu.0].status = CpuStatus::Halted;
        self.push_event(LogEvent::CpuHalted { cpu });

        logging::info("sched_halt");
        logging::info_u64(" cpu", cpu.0 as u64);
        Dispatch::Halt
    }
}
