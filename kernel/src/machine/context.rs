// kernel/src/machine/context.rs
//
// 役割:
// - 「いま cpu 上でユーザモードとして走っている env」から見たマシン（UserContext）。
// - ユーザプログラムはこれを通してメモリを読み書きし、syscall / int を発行する。
//
// やること:
// - load / store: env のページテーブルを MMU と同じ規則で歩く。
//   フォルトしたら cr2 を設定して T_PGFLT で trap し、
//   upcall に飛ばされたら Rust のハンドラと pfentry 相当を走らせてから再試行する。
// - syscall: レジスタに詰めて T_SYSCALL で trap し、戻ってきた eax を返す。
// - ide_read / ide_write: IOPL 3 のときだけ許す（それ以外は #GP で trap）。
//
// やらないこと:
// - 命令列の解釈（ユーザの処理は Rust のステートマシンとして書く）
//
// [不変条件]
// - trap の後で cpu の curenv が自分でなくなっていたら、以後の操作はすべて
//   Descheduled（まだ生きている）か Destroyed（もう居ない）で失敗する。

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::{EnvRuntime, MachineCore, PgfaultHandler, UserError, UserProgram};
use crate::arch::interrupts::{software_interrupt_vector, IRQ_OFFSET, IRQ_TIMER, T_GPFLT, T_PGFLT, T_SYSCALL};
use crate::arch::trapframe::{Trapframe, UTrapframe, UTF_ESP_OFFSET, UTRAPFRAME_SIZE};
use crate::dev::ide::BlockDevice;
use crate::kernel::{Env, EnvId, EnvStatus, KernelError, Syscall};
use crate::mem::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mem::address_space::Access;
use crate::mm::PhysicalMemoryManager;
use crate::types::CpuId;
use x86_64::structures::idt::PageFaultErrorCode;

/// 1 回のアクセスで許すフォルトの回数（upcall が同じページを直せなければ諦める）
const MAX_FAULT_RETRIES: usize = 4;

pub struct UserContext<'m> {
    core: &'m mut MachineCore,
    cpu: CpuId,
    env: EnvId,
}

impl<'m> UserContext<'m> {
    pub(super) fn new(core: &'m mut MachineCore, cpu: CpuId, env: EnvId) -> Self {
        UserContext { core, cpu, env }
    }

    pub fn env_id(&self) -> EnvId {
        self.env
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// いまのユーザレジスタ
    pub fn live_context(&self) -> Result<Trapframe, UserError> {
        self.ensure_running()
    }

    fn ensure_running(&self) -> Result<Trapframe, UserError> {
        if self.core.kernel.current_env(self.cpu) != Some(self.env) {
            return Err(self.gone());
        }
        self.core
            .platform
            .live_context(self.cpu)
            .ok_or(UserError::Descheduled)
    }

    fn gone(&self) -> UserError {
        if self.core.kernel.env_alive(self.env) {
            UserError::Descheduled
        } else {
            UserError::Destroyed
        }
    }

    /// ユーザコンテキストを手放してカーネルへ入る
    fn enter_kernel(&mut self, tf: Trapframe) {
        let _ = self.core.platform.take_live_context(self.cpu);
        self.core.kernel.trap(self.cpu, tf);
    }

    //
    // env 情報（UENVS を公開しない代わりに、カーネル状態のスナップショットを読む）
    //
    pub fn thisenv(&self) -> Result<Env, UserError> {
        let env = self.env;
        self.core
            .kernel
            .with_state(self.cpu, |ks| ks.env(env).cloned())
            .ok_or(UserError::Destroyed)
    }

    /// Free でない env の一覧
    pub fn env_snapshots(&self) -> Vec<Env> {
        self.core.kernel.with_state(self.cpu, |ks| {
            ks.envs()
                .iter()
                .filter(|e| e.status != EnvStatus::Free)
                .cloned()
                .collect()
        })
    }

    //
    // syscall
    //
    pub fn syscall(&mut self, sc: Syscall) -> Result<i32, UserError> {
        let mut tf = self.ensure_running()?;
        let a = sc.args();
        tf.regs.eax = sc.number();
        tf.regs.edx = a[0];
        tf.regs.ecx = a[1];
        tf.regs.ebx = a[2];
        tf.regs.edi = a[3];
        tf.regs.esi = a[4];
        tf.trapno = T_SYSCALL;
        tf.err = 0;

        self.enter_kernel(tf);
        let tf = self.ensure_running()?;
        Ok(tf.regs.eax as i32)
    }

    /// `int vector`。DPL 3 のゲートが無いベクタは #GP になる。
    pub fn int(&mut self, vector: u32) -> Result<(), UserError> {
        let mut tf = self.ensure_running()?;
        tf.trapno = software_interrupt_vector(vector);
        tf.err = 0;
        self.enter_kernel(tf);
        self.ensure_running().map(|_| ())
    }

    /// ユーザ実行中に timer 割り込みが入る
    pub fn timer_tick(&mut self) -> Result<(), UserError> {
        let mut tf = self.ensure_running()?;
        tf.trapno = IRQ_OFFSET + IRQ_TIMER;
        tf.err = 0;
        self.enter_kernel(tf);
        self.ensure_running().map(|_| ())
    }

    //
    // ユーザランタイム
    //
    pub fn pgfault_handler(&self) -> Option<PgfaultHandler> {
        self.core.runtimes.get(&self.env).and_then(|r| r.pgfault)
    }

    pub fn set_pgfault_handler_fn(&mut self, handler: PgfaultHandler) {
        self.core
            .runtimes
            .entry(self.env)
            .or_insert_with(EnvRuntime::default)
            .pgfault = Some(handler);
    }

    /// 子 env に走らせるプログラムを登録する。ランタイム（ハンドラ）は親から引き継ぐ。
    pub fn adopt(&mut self, child: EnvId, program: Box<dyn UserProgram>) {
        if let Some(rt) = self.core.runtimes.get(&self.env).copied() {
            self.core.runtimes.insert(child, rt);
        }
        self.core.adopted.push((child, program));
    }

    //
    // メモリ
    //
    pub fn load_u32(&mut self, va: VirtAddr) -> Result<u32, UserError> {
        let mut b = [0u8; 4];
        self.load_bytes(va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn store_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), UserError> {
        self.store_bytes(va, &value.to_le_bytes())
    }

    pub fn load_u8(&mut self, va: VirtAddr) -> Result<u8, UserError> {
        let mut b = [0u8; 1];
        self.load_bytes(va, &mut b)?;
        Ok(b[0])
    }

    pub fn store_u8(&mut self, va: VirtAddr, value: u8) -> Result<(), UserError> {
        self.store_bytes(va, &[value])
    }

    pub fn load_bytes(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), UserError> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va
                .checked_add(done as u32)
                .ok_or(UserError::Kernel(KernelError::Fault))?;
            let n = core::cmp::min(PAGE_SIZE as usize - cur.page_offset(), buf.len() - done);
            let chunk = &mut buf[done..done + n];
            self.access_page(cur, false, |pmm, pa| pmm.read_phys(pa, &mut chunk[..]))?;
            done += n;
        }
        Ok(())
    }

    pub fn store_bytes(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), UserError> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va
                .checked_add(done as u32)
                .ok_or(UserError::Kernel(KernelError::Fault))?;
            let n = core::cmp::min(PAGE_SIZE as usize - cur.page_offset(), data.len() - done);
            let chunk = &data[done..done + n];
            self.access_page(cur, true, |pmm, pa| pmm.write_phys(pa, chunk))?;
            done += n;
        }
        Ok(())
    }

    /// 1 ページ内のアクセス。フォルトしたら trap して再試行する。
    fn access_page(
        &mut self,
        va: VirtAddr,
        write: bool,
        mut op: impl FnMut(&mut PhysicalMemoryManager, PhysAddr),
    ) -> Result<(), UserError> {
        let access = if write {
            Access::USER_WRITE
        } else {
            Access::USER_READ
        };

        for _ in 0..MAX_FAULT_RETRIES {
            self.ensure_running()?;
            let env = self.env;
            let r = self.core.kernel.with_state(self.cpu, |ks| {
                let Some(space) = ks.env(env).and_then(|e| e.pgdir) else {
                    return Err(None);
                };
                let pa = space.translate(ks.pmm_mut(), va, access).map_err(Some)?;
                op(ks.pmm_mut(), pa);
                Ok(())
            });
            match r {
                Ok(()) => return Ok(()),
                Err(None) => return Err(UserError::Destroyed),
                Err(Some(code)) => self.page_fault(va, code)?,
            }
        }
        Err(UserError::Panic("page fault not resolved"))
    }

    /// MMU がフォルトを上げた
    fn page_fault(&mut self, va: VirtAddr, code: PageFaultErrorCode) -> Result<(), UserError> {
        let mut tf = self.ensure_running()?;
        tf.trapno = T_PGFLT;
        tf.err = code.bits() as u32;
        self.core.platform.set_cr2(self.cpu, va.0);
        self.enter_kernel(tf);

        let live = self.ensure_running()?;
        let e = self.thisenv()?;
        match e.pgfault_upcall {
            Some(entry) if live.eip == entry.0.0 && e.xstack.is_active() => self.run_upcall(),
            _ => Ok(()),
        }
    }

    /// 例外スタック上の UTrapframe をハンドラに渡し、pfentry と同じ手順で元へ戻る
    fn run_upcall(&mut self) -> Result<(), UserError> {
        let live = self.ensure_running()?;
        let top = VirtAddr(live.esp);

        let Some(handler) = self.pgfault_handler() else {
            return Err(UserError::Panic("page fault upcall with no handler"));
        };
        let utf = self.read_utrapframe(top)?;
        handler(self, &utf)?;

        // ハンドラが書き換えていてもよいので読み直す
        let utf = self.read_utrapframe(top)?;

        // trap-time esp の 1 word 下に trap-time eip を積み、esp をそこへ更新する
        let new_esp = utf.esp.wrapping_sub(4);
        self.store_u32(VirtAddr(top.0 + UTF_ESP_OFFSET as u32), new_esp)?;
        self.store_u32(VirtAddr(new_esp), utf.eip)?;

        // popal / popfl / popl %esp / ret
        let mut tf = self.ensure_running()?;
        tf.regs = utf.regs;
        tf.eflags = utf.eflags;
        tf.esp = new_esp.wrapping_add(4);
        tf.eip = utf.eip;
        self.core.platform.set_live_context(self.cpu, tf);

        let env = self.env;
        self.core.kernel.with_state(self.cpu, |ks| {
            if let Ok(idx) = ks.envid2env(env, false) {
                ks.upcall_returned(idx);
            }
        });
        Ok(())
    }

    fn read_utrapframe(&mut self, at: VirtAddr) -> Result<UTrapframe, UserError> {
        let mut raw = [0u8; UTRAPFRAME_SIZE];
        self.load_bytes(at, &mut raw)?;
        Ok(UTrapframe::from_bytes(&raw))
    }

    //
    // ディスク（in / out 命令の代わり）
    //
    fn require_iopl(&mut self) -> Result<(), UserError> {
        let tf = self.ensure_running()?;
        if tf.iopl() == 3 {
            return Ok(());
        }
        // I/O 命令を IOPL 0 で実行した
        let mut tf = tf;
        tf.trapno = T_GPFLT;
        tf.err = 0;
        self.enter_kernel(tf);
        self.ensure_running()?;
        Err(UserError::Kernel(KernelError::Fault))
    }

    pub fn ide_read(&mut self, secno: u32, buf: &mut [u8], nsecs: usize) -> Result<(), UserError> {
        self.require_iopl()?;
        self.core
            .disk
            .read_sectors(secno, buf, nsecs)
            .map_err(UserError::Kernel)
    }

    pub fn ide_write(&mut self, secno: u32, buf: &[u8], nsecs: usize) -> Result<(), UserError> {
        self.require_iopl()?;
        self.core
            .disk
            .write_sectors(secno, buf, nsecs)
            .map_err(UserError::Kernel)
    }
}
