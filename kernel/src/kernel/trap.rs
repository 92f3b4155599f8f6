// kernel/src/kernel/trap.rs
//
// 役割:
// - trap の入口（KernelState::trap）と dispatch。
// - ページフォルトの振り分け（upcall / カーネル COW / env を壊す）。
// - trapframe のダンプ。
//
// やること:
// - ユーザから来た trap は curenv の tf に保存してから処理する（DYING ならここで回収）
// - timer: EOI を先に送ってから scheduler へ
// - syscall: 戻り値を curenv の eax に書く（curenv が消えていれば書かない）
//
// やらないこと:
// - lock の取得 / 解放と resume（Kernel::trap 側）
//
// [不変条件]
// - カーネルモードでのページフォルトと未処理例外は panic。
// - 例外スタックの溢れ / 書けない例外スタックは env を壊す（カーネルは巻き込まない）。

use x86_64::structures::idt::PageFaultErrorCode;

use super::env::ExceptionStack;
use super::{CpuStatus, Dispatch, EnvStatus, KernelState, LogEvent};
use crate::arch::interrupts::{
    classify, trapname, TrapClass, IRQ_KBD, IRQ_SERIAL, IRQ_SPURIOUS, IRQ_TIMER, T_BRKPT,
    T_PGFLT,
};
use crate::arch::trapframe::{Trapframe, UTrapframe, UTRAPFRAME_SIZE};
use crate::logging;
use crate::mem::addr::VirtAddr;
use crate::mem::address_space::Access;
use crate::mem::layout::{USTACKTOP, UXSTACKTOP};
use crate::mem::paging::PteFlags;
use crate::types::CpuId;

impl KernelState {
    //
    // trap(): lock を持った状態で呼ばれる
    //
    pub fn trap(&mut self, cpu: CpuId, tf: Trapframe) -> Dispatch {
        self.this_cpu = cpu;
        self.counters.traps += 1;

        // halt 中に割り込みで起こされた → lock を取り直した
        if self.cpus[cpu.0].status == CpuStatus::Halted {
            self.cpus[cpu.0].status = CpuStatus::Started;
            self.push_event(LogEvent::CpuStarted { cpu });
            logging::info("trap: cpu woke from halt");
            logging::info_u64(" cpu", cpu.0 as u64);
        }

        let env = self.curenv_id();
        self.push_event(LogEvent::TrapEntered {
            cpu,
            trapno: tf.trapno,
            env,
        });

        if tf.from_user() {
            let Some(cur) = self.curenv() else {
                panic!("trap from user mode with no curenv on cpu {}", cpu.0);
            };

            // 他の CPU から destroy された
            if self.envs[cur].status == EnvStatus::Dying {
                self.env_free(cur);
                self.cpus[cpu.0].env = None;
                return self.sched_yield();
            }

            self.envs[cur].tf = tf;
        }

        self.last_tf = Some(tf);
        self.yield_requested = false;

        self.trap_dispatch(&tf);

        match self.curenv() {
            Some(cur) if self.envs[cur].status == EnvStatus::Running && !self.yield_requested => {
                self.env_run(cur)
            }
            _ => self.sched_yield(),
        }
    }

    fn trap_dispatch(&mut self, tf: &Trapframe) {
        match classify(tf.trapno) {
            TrapClass::Exception if tf.trapno == T_PGFLT => self.page_fault_handler(tf),
            TrapClass::Exception if tf.trapno == T_BRKPT => self.monitor(Some(tf)),
            TrapClass::Syscall => {
                let r = &tf.regs;
                let ret = self.syscall(r.eax, r.edx, r.ecx, r.ebx, r.edi, r.esi);
                if let Some(cur) = self.curenv() {
                    self.envs[cur].tf.regs.eax = ret as u32;
                }
            }
            TrapClass::Irq(IRQ_TIMER) => {
                let cpu = self.this_cpu;
                self.platform.lapic_eoi(cpu);
                self.push_event(LogEvent::TimerEoi { cpu });
                self.counters.timer_ticks += 1;
                self.yield_requested = true;
            }
            TrapClass::Irq(irq) if irq == IRQ_KBD || irq == IRQ_SERIAL => {
                self.console.interrupt(irq);
            }
            TrapClass::Irq(IRQ_SPURIOUS) => {
                // スプリアス割り込みは EOI 不要
                cprintf!(self, "Spurious interrupt on irq 7\n");
                self.print_trapframe(tf);
            }
            TrapClass::Irq(irq) => {
                // 受け持つドライバの無いデバイス割り込みもスプリアス扱いで捨てる
                logging::info("trap: spurious device interrupt ignored");
                logging::info_u64(" irq", irq as u64);
                self.push_event(LogEvent::IrqIgnored { cpu: self.this_cpu, irq });
            }
            TrapClass::Exception | TrapClass::Unknown => {
                self.print_trapframe(tf);
                if !tf.from_user() {
                    panic!("unhandled trap in kernel: {}", trapname(tf.trapno));
                }
                if let Some(cur) = self.curenv() {
                    self.env_destroy(cur);
                }
            }
        }
    }

    //
    // page_fault_handler()
    //
    fn page_fault_handler(&mut self, tf: &Trapframe) {
        let fault_va = self.platform.rcr2(self.this_cpu);

        if !tf.from_user() {
            self.print_trapframe(tf);
            panic!("kernel page fault va {:08x} ip {:08x}", fault_va, tf.eip);
        }

        let Some(cur) = self.curenv() else {
            panic!("user page fault with no curenv");
        };

        if self.envs[cur].pgfault_upcall.is_some() {
            self.deliver_page_fault_upcall(cur, tf, fault_va);
            return;
        }

        // upcall を持たない env の COW 書き込みはカーネルが肩代わりする
        let code = PageFaultErrorCode::from_bits_truncate(tf.err as u64);
        if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            let space = self.space_of(cur);
            let pte = space.read_pte(&self.pmm, VirtAddr(fault_va));
            if pte.is_present()
                && pte.flags().contains(PteFlags::COW)
                && self.handle_cow_fault(cur, VirtAddr(fault_va), tf.err).is_ok()
            {
                return;
            }
        }

        let env = self.envs[cur].id;
        cprintf!(self, "[{}] user fault va {:08x} ip {:08x}\n", env, fault_va, tf.eip);
        self.print_trapframe(tf);
        self.counters.user_faults += 1;
        self.push_event(LogEvent::UserFault {
            env,
            va: VirtAddr(fault_va),
        });
        self.env_destroy(cur);
    }

    //
    // deliver_page_fault_upcall(): 例外スタックに UTrapframe を積んで upcall へ飛ぶ
    //
    pub(super) fn deliver_page_fault_upcall(&mut self, idx: usize, tf: &Trapframe, fault_va: u32) {
        let Some(upcall) = self.envs[idx].pgfault_upcall else {
            return;
        };
        let env = self.envs[idx].id;

        // 通常スタックと例外スタックの間の空きページ（esp == USTACKTOP は空の通常スタック）
        if tf.esp > USTACKTOP && tf.esp < ExceptionStack::BOTTOM.0 {
            cprintf!(self, "[{}] user_mem_check assertion failure for va {:08x}\n", env, tf.esp);
            self.env_destroy(idx);
            return;
        }

        let recursive = self.envs[idx].xstack.is_active();
        // 再帰時は trap-time esp の下に 1 word 空ける（pfentry が eip を積む場所）
        let top = if recursive {
            (tf.esp as u64).checked_sub(UTRAPFRAME_SIZE as u64 + 4)
        } else {
            Some((UXSTACKTOP - UTRAPFRAME_SIZE as u32) as u64)
        };

        let top = match top {
            Some(t) if t >= ExceptionStack::BOTTOM.0 as u64 && t < UXSTACKTOP as u64 => t as u32,
            other => {
                // 例外スタック溢れ
                let shown = other.unwrap_or(0) as u32;
                cprintf!(self, "[{}] user_mem_check assertion failure for va {:08x}\n", env, shown);
                self.env_destroy(idx);
                return;
            }
        };

        if self
            .user_mem_assert(idx, VirtAddr(top), UXSTACKTOP - top, PteFlags::WRITABLE)
            .is_err()
        {
            return;
        }

        let utf = UTrapframe {
            fault_va,
            err: tf.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        };
        let space = self.space_of(idx);
        if space
            .copy_to(&mut self.pmm, VirtAddr(top), &utf.to_bytes(), Access::KERNEL_WRITE)
            .is_err()
        {
            // user_mem_assert を通ったので起きないはず
            panic!("upcall frame write failed after check");
        }

        let e = &mut self.envs[idx];
        e.tf.eip = upcall.0.0;
        e.tf.esp = top;
        e.xstack.enter();

        self.counters.upcalls += 1;
        self.push_event(LogEvent::PageFaultUpcall {
            env,
            va: VirtAddr(fault_va),
            recursive,
        });
    }

    //
    // upcall_returned(): pfentry が trap-time の状態へ戻った
    //
    pub fn upcall_returned(&mut self, idx: usize) {
        self.envs[idx].xstack.leave();
    }

    //
    // print_trapframe()
    //
    pub fn print_trapframe(&mut self, tf: &Trapframe) {
        let cpu = self.this_cpu.0;
        cprintf!(self, "TRAP frame from CPU {}\n", cpu);

        let r = tf.regs;
        cprintf!(self, "  edi  0x{:08x}\n", r.edi);
        cprintf!(self, "  esi  0x{:08x}\n", r.esi);
        cprintf!(self, "  ebp  0x{:08x}\n", r.ebp);
        cprintf!(self, "  oesp 0x{:08x}\n", r.oesp);
        cprintf!(self, "  ebx  0x{:08x}\n", r.ebx);
        cprintf!(self, "  edx  0x{:08x}\n", r.edx);
        cprintf!(self, "  ecx  0x{:08x}\n", r.ecx);
        cprintf!(self, "  eax  0x{:08x}\n", r.eax);
        cprintf!(self, "  es   0x----{:04x}\n", tf.es);
        cprintf!(self, "  ds   0x----{:04x}\n", tf.ds);
        cprintf!(self, "  trap 0x{:08x} {}\n", tf.trapno, trapname(tf.trapno));

        // cr2 は直近の trap のものしか意味がない
        if tf.trapno == T_PGFLT && self.last_tf.as_ref() == Some(tf) {
            let cr2 = self.platform.rcr2(self.this_cpu);
            cprintf!(self, "  cr2  0x{:08x}\n", cr2);
        }

        if tf.trapno == T_PGFLT {
            let code = PageFaultErrorCode::from_bits_truncate(tf.err as u64);
            cprintf!(
                self,
                "  err  0x{:08x} [{}, {}, {}]\n",
                tf.err,
                if code.contains(PageFaultErrorCode::USER_MODE) { "user" } else { "kernel" },
                if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) { "write" } else { "read" },
                if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
                    "protection"
                } else {
                    "not-present"
                }
            );
        } else {
            cprintf!(self, "  err  0x{:08x}\n", tf.err);
        }

        cprintf!(self, "  eip  0x{:08x}\n", tf.eip);
        cprintf!(self, "  cs   0x----{:04x}\n", tf.cs);
        cprintf!(self, "  flag 0x{:08x}\n", tf.eflags);
        if tf.from_user() {
            cprintf!(self, "  esp  0x{:08x}\n", tf.esp);
            cprintf!(self, "  ss   0x----{:04x}\n", tf.ss);
        }
    }
}
