// src/kernel/mod.rs
//
// exokernel: env（ユーザ環境）＋ COW fork ＋ upcall ＋ IPC ＋ round-robin ＋ big kernel lock
//
// - KernelState: カーネルの全状態（物理メモリ、env 配列、CPU ごとの情報、イベントログ）
// - Kernel: KernelState を big kernel lock で包み、Platform（CPU/MMU 制御）と組にしたもの
// - trap(cpu, tf) が唯一の入口。lock を取り、dispatch し、次に走らせる env を選んで
//   lock を放してから Platform::resume / halt に渡す。
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. env と CPU の関係
//    - cpus[c].env == Some(i) なら envs[i].status == Running かつ envs[i].cpu == Some(c)。
//    - Running の env は必ずどれか 1 つの CPU の curenv である。
//
// 2. env の free list
//    - Free の env はちょうど free list 上にあるものだけ。
//    - Free でない env は必ずページディレクトリを持つ。
//
// 3. ページ
//    - ユーザ空間の PTE で COW と WRITABLE が同時に立つことはない。
//    - 物理フレームの free list ⇔ ref_count == 0（mm の自己検査で確認）。
//
// これらは debug_check_invariants() でログ出力ベースに検証される。

/// console への書式付き出力（cprintf 相当）
macro_rules! cprintf {
    ($ks:expr, $($arg:tt)*) => {
        $ks.cprint(format_args!($($arg)*))
    };
}

pub mod env;
pub mod error;
pub mod fork;
pub mod ipc;
pub mod lock;
pub mod monitor;
pub mod sched;
pub mod syscall;
pub mod trace;
pub mod trap;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::trapframe::Trapframe;
use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::dev::console::{Console, ConsoleWriter};
use crate::logging;
use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr};
use crate::mem::address_space::{AddressSpace, TlbScope};
use crate::mem::layout::{EXTPHYSMEM, UTOP};
use crate::mem::paging::{MemAction, PteFlags};
use crate::mm::{pagetable_init, PhysicalMemoryManager};
use crate::types::CpuId;

pub use env::{Env, EnvId, EnvStatus, EnvType, ExceptionStack, IpcState, UpcallEntry, NENV};
pub use error::KernelError;
pub use lock::{BigKernelLock, KernelGuard};
pub use syscall::Syscall;

const EVENT_LOG_CAP: usize = 1024;

//
// ──────────────────────────────────────────────
// CPU ごとの状態
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    Unused,
    Started,
    Halted,
}

#[derive(Clone, Copy, Debug)]
pub struct CpuInfo {
    pub id: CpuId,
    pub status: CpuStatus,
    /// curenv（envs の index）
    pub env: Option<usize>,
    /// 最後にこの CPU で走らせた env の index（round-robin の起点）
    pub last_run: Option<usize>,
}

/// trap 処理の結論。lock を放した後で Platform に渡す。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Resume(Trapframe),
    Halt,
}

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    EnvAllocated { env: EnvId, parent: EnvId },
    EnvFreed { env: EnvId },
    EnvMarkedDying { env: EnvId },
    EnvRun { cpu: CpuId, env: EnvId },
    StatusChanged { env: EnvId, status: EnvStatus },
    TrapEntered { cpu: CpuId, trapno: u32, env: Option<EnvId> },
    TimerEoi { cpu: CpuId },
    /// ドライバの無いデバイス割り込み（スプリアス扱い）
    IrqIgnored { cpu: CpuId, irq: u32 },
    SyscallHandled { env: EnvId, num: u32, ret: i32 },

    /// どの env のアドレス空間に、syscall 経由でどんな MemAction を起こしたか。
    MemActionApplied { env: EnvId, action: MemAction },

    PageFaultUpcall { env: EnvId, va: VirtAddr, recursive: bool },
    CowFaultServiced { env: EnvId, va: VirtAddr },
    UserFault { env: EnvId, va: VirtAddr },
    IpcDelivered { from: EnvId, to: EnvId, value: u32, page: bool },
    Forked { parent: EnvId, child: EnvId },
    CpuHalted { cpu: CpuId },
    CpuStarted { cpu: CpuId },
    MonitorEntered { cpu: CpuId },
}

/// 観測用カウンタ（ログ量を増やさずに経路を数える）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub traps: u64,
    pub syscalls: u64,
    pub timer_ticks: u64,
    pub ipc_sent: u64,
    pub ipc_page_sent: u64,
    pub ipc_not_recv: u64,
    pub ipc_recv_blocked: u64,
    pub cow_faults: u64,
    pub upcalls: u64,
    pub user_faults: u64,
    pub envs_freed: u64,
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState {
    pmm: PhysicalMemoryManager,
    kern_pgdir: AddressSpace,

    envs: Vec<Env>,
    env_free_head: Option<usize>,

    cpus: Vec<CpuInfo>,
    // いま lock を持って動いている CPU（JOS の thiscpu）
    this_cpu: CpuId,

    console: Box<dyn Console>,
    console_echo: bool,
    platform: Arc<dyn Platform>,

    // 抽象イベントログ（古いものから捨てる）
    event_log: VecDeque<LogEvent>,

    last_tf: Option<Trapframe>,
    // sys_yield / timer: dispatch 後に curenv を続行せず sched_yield する
    yield_requested: bool,

    pub counters: KernelCounters,
}

impl KernelState {
    //
    // new(): mem_init + env_init 相当
    //
    pub fn new(config: &KernelConfig, platform: Arc<dyn Platform>, console: Box<dyn Console>) -> Self {
        logging::info("KernelState::new()");
        logging::info_u64(" phys_memory_kb", (config.phys_memory_bytes / 1024) as u64);
        logging::info_u64(" ncpu", config.ncpu as u64);

        let map = config.memory_map();
        let kernel_end = PhysAddr(EXTPHYSMEM + config.kernel_image_bytes);
        let mut pmm = PhysicalMemoryManager::new(&map, kernel_end);

        let boot = pagetable_init::boot_reserve(&mut pmm, config.ncpu);
        pmm.page_init();
        pmm.check_free_list();

        let kern_pgdir = pagetable_init::build_kernel_directory(&mut pmm, &boot, map.top_of_memory());
        platform.lcr3(CpuId(0), kern_pgdir.root().start_address());

        let (envs, env_free_head) = env::init_envs();

        let cpus = (0..config.ncpu)
            .map(|i| CpuInfo {
                id: CpuId(i),
                status: CpuStatus::Unused,
                env: None,
                last_run: None,
            })
            .collect();

        KernelState {
            pmm,
            kern_pgdir,
            envs,
            env_free_head,
            cpus,
            this_cpu: CpuId(0),
            console,
            console_echo: config.console_echo,
            platform,
            event_log: VecDeque::with_capacity(EVENT_LOG_CAP),
            last_tf: None,
            yield_requested: false,
            counters: KernelCounters::default(),
        }
    }

    //
    // イベントログ
    //
    fn push_event(&mut self, ev: LogEvent) {
        if self.event_log.len() >= EVENT_LOG_CAP {
            self.event_log.pop_front();
        }
        self.event_log.push_back(ev);
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> + '_ {
        self.event_log.iter()
    }

    pub fn clear_events(&mut self) {
        self.event_log.clear();
    }

    /// console へ書く。echo 設定なら logging にも流す。
    pub fn cprint(&mut self, args: fmt::Arguments<'_>) {
        let mut w = ConsoleWriter(self.console.as_mut());
        let _ = fmt::Write::write_fmt(&mut w, args);
        if self.console_echo {
            logging::info(&alloc::fmt::format(args));
        }
    }

    //
    // アクセサ
    //
    pub fn pmm(&self) -> &PhysicalMemoryManager {
        &self.pmm
    }

    pub fn pmm_mut(&mut self) -> &mut PhysicalMemoryManager {
        &mut self.pmm
    }

    pub fn kern_pgdir(&self) -> AddressSpace {
        self.kern_pgdir
    }

    pub fn cpu_info(&self, cpu: CpuId) -> &CpuInfo {
        &self.cpus[cpu.0]
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    pub fn last_tf(&self) -> Option<Trapframe> {
        self.last_tf
    }

    pub fn envs(&self) -> &[Env] {
        &self.envs
    }

    /// id が生きている env を指していれば返す（世代も見る）
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        let e = &self.envs[id.index()];
        if e.status == EnvStatus::Free || e.id != id {
            return None;
        }
        Some(e)
    }

    /// cpu の curenv の id
    pub fn curenv_on(&self, cpu: CpuId) -> Option<EnvId> {
        self.cpus
            .get(cpu.0)
            .and_then(|c| c.env)
            .map(|i| self.envs[i].id)
    }

    fn curenv(&self) -> Option<usize> {
        self.cpus[self.this_cpu.0].env
    }

    fn curenv_id(&self) -> Option<EnvId> {
        self.curenv().map(|i| self.envs[i].id)
    }

    /// いまの CPU で有効なディレクトリ（curenv のもの）
    fn active_root(&self) -> Option<PhysFrame> {
        self.curenv()
            .and_then(|i| self.envs[i].pgdir)
            .map(|s| s.root())
    }

    fn space_of(&self, idx: usize) -> AddressSpace {
        match self.envs[idx].pgdir {
            Some(s) => s,
            None => panic!("env {} has no page directory", self.envs[idx].id),
        }
    }

    /// pmm と TLB 範囲を借りてページテーブル操作をする
    fn with_vm<R>(
        &mut self,
        f: impl FnOnce(&mut PhysicalMemoryManager, &TlbScope<'_>) -> R,
    ) -> R {
        let platform = Arc::clone(&self.platform);
        let tlb = TlbScope::new(&*platform, self.this_cpu, self.active_root());
        f(&mut self.pmm, &tlb)
    }

    fn set_status(&mut self, idx: usize, status: EnvStatus) {
        self.envs[idx].status = status;
        let env = self.envs[idx].id;
        self.push_event(LogEvent::StatusChanged { env, status });
    }

    /// ブート CPU / AP が最初にスケジューラへ入る
    pub fn start_cpu(&mut self, cpu: CpuId) -> Dispatch {
        self.this_cpu = cpu;
        self.cpus[cpu.0].status = CpuStatus::Started;
        self.push_event(LogEvent::CpuStarted { cpu });
        logging::info("start_cpu");
        logging::info_u64(" cpu", cpu.0 as u64);
        self.sched_yield()
    }

    //
    // debug_check_invariants(): 違反の数を返す（0 なら OK）
    //
    pub fn debug_check_invariants(&self) -> usize {
        let mut violations = 0;

        // 1. CPU と Running env の対応
        for c in &self.cpus {
            if let Some(i) = c.env {
                let e = &self.envs[i];
                if e.status != EnvStatus::Running || e.cpu != Some(c.id) {
                    logging::error("INVARIANT VIOLATION: curenv is not running on its cpu");
                    logging::info_u64(" cpu", c.id.0 as u64);
                    logging::info_hex(" env", e.id.raw());
                    violations += 1;
                }
            }
        }
        for (i, e) in self.envs.iter().enumerate() {
            if e.status == EnvStatus::Running && !self.cpus.iter().any(|c| c.env == Some(i)) {
                logging::error("INVARIANT VIOLATION: running env is nobody's curenv");
                logging::info_hex(" env", e.id.raw());
                violations += 1;
            }
        }

        // 2. env free list
        let mut on_list = alloc::vec![false; NENV];
        let mut cur = self.env_free_head;
        let mut steps = 0;
        while let Some(i) = cur {
            if steps > NENV || on_list[i] {
                logging::error("INVARIANT VIOLATION: env free list has a cycle");
                violations += 1;
                break;
            }
            on_list[i] = true;
            steps += 1;
            cur = self.envs[i].link;
        }
        for (i, e) in self.envs.iter().enumerate() {
            let free = e.status == EnvStatus::Free;
            if free != on_list[i] {
                logging::error("INVARIANT VIOLATION: env free list does not match Free status");
                logging::info_u64(" env_index", i as u64);
                violations += 1;
            }
            if !free && e.pgdir.is_none() {
                logging::error("INVARIANT VIOLATION: live env has no page directory");
                logging::info_hex(" env", e.id.raw());
                violations += 1;
            }
        }

        // 3. COW ⇒ ¬W
        for e in self.envs.iter().filter(|e| e.status != EnvStatus::Free) {
            if let Some(space) = e.pgdir {
                space.for_each_mapping(&self.pmm, VirtAddr(UTOP), |va, pte| {
                    let f = pte.flags();
                    if f.contains(PteFlags::COW) && f.contains(PteFlags::WRITABLE) {
                        logging::error("INVARIANT VIOLATION: page is both COW and writable");
                        logging::info_hex(" env", e.id.raw());
                        logging::info_hex(" va", va.0);
                        violations += 1;
                    }
                });
            }
        }

        violations
    }

    //
    // dump_events()
    //
    pub fn dump_events(&self) {
        logging::info("=== KernelState Event Log Dump ===");
        for ev in self.event_log.iter() {
            log_event(ev);
        }
        logging::info("=== End of Event Log ===");

        logging::info("=== Env Dump ===");
        for e in self.envs.iter().filter(|e| e.status != EnvStatus::Free) {
            logging::info(" Env:");
            logging::info_hex("  id", e.id.raw());
            logging::info_hex("  parent", e.parent_id.raw());
            logging::info_u64("  status", e.status as u64);
            logging::info_u64("  runs", e.runs as u64);
            if let Some(space) = e.pgdir {
                logging::info_hex("  pgdir", space.root().start_address().0);
                logging::info_u64("  mapping_count", space.mapping_count(&self.pmm) as u64);
            }
        }
        logging::info("=== End of Env Dump ===");

        logging::info_u64("free_frames", self.pmm.free_frames() as u64);
        logging::info_u64("syscalls", self.counters.syscalls);
        logging::info_u64("ipc_sent", self.counters.ipc_sent);
        logging::info_u64("cow_faults", self.counters.cow_faults);
    }
}

fn log_event(ev: &LogEvent) {
    match *ev {
        LogEvent::EnvAllocated { env, parent } => {
            logging::info("EV: EnvAllocated");
            logging::info_hex(" env", env.raw());
            logging::info_hex(" parent", parent.raw());
        }
        LogEvent::EnvFreed { env } => {
            logging::info("EV: EnvFreed");
            logging::info_hex(" env", env.raw());
        }
        LogEvent::EnvMarkedDying { env } => {
            logging::info("EV: EnvMarkedDying");
            logging::info_hex(" env", env.raw());
        }
        LogEvent::EnvRun { cpu, env } => {
            logging::info("EV: EnvRun");
            logging::info_u64(" cpu", cpu.0 as u64);
            logging::info_hex(" env", env.raw());
        }
        LogEvent::StatusChanged { env, status } => {
            logging::info("EV: StatusChanged");
            logging::info_hex(" env", env.raw());
            logging::info_u64(" status", status as u64);
        }
        LogEvent::TrapEntered { cpu, trapno, env } => {
            logging::info("EV: TrapEntered");
            logging::info_u64(" cpu", cpu.0 as u64);
            logging::info_u64(" trapno", trapno as u64);
            if let Some(env) = env {
                logging::info_hex(" env", env.raw());
            }
        }
        LogEvent::TimerEoi { cpu } => {
            logging::info("EV: TimerEoi");
            logging::info_u64(" cpu", cpu.0 as u64);
        }
        LogEvent::IrqIgnored { cpu, irq } => {
            logging::info("EV: IrqIgnored");
            logging::info_u64(" cpu", cpu.0 as u64);
            logging::info_u64(" irq", irq as u64);
        }
        LogEvent::SyscallHandled { env, num, ret } => {
            logging::info("EV: SyscallHandled");
            logging::info_hex(" env", env.raw());
            logging::info_u64(" num", num as u64);
            logging::info_hex(" ret", ret as u32);
        }
        LogEvent::MemActionApplied { env, action } => {
            logging::info("EV: MemActionApplied");
            logging::info_hex(" env", env.raw());
            match action {
                MemAction::Map { page, frame, flags } => {
                    logging::info("  action = Map");
                    logging::info_hex("  va", page.start_address().0);
                    logging::info_hex("  pa", frame.start_address().0);
                    logging::info_hex("  flags", flags.bits());
                }
                MemAction::Unmap { page } => {
                    logging::info("  action = Unmap");
                    logging::info_hex("  va", page.start_address().0);
                }
            }
        }
        LogEvent::PageFaultUpcall { env, va, recursive } => {
            logging::info("EV: PageFaultUpcall");
            logging::info_hex(" env", env.raw());
            logging::info_hex(" va", va.0);
            logging::info_u64(" recursive", recursive as u64);
        }
        LogEvent::CowFaultServiced { env, va } => {
            logging::info("EV: CowFaultServiced");
            logging::info_hex(" env", env.raw());
            logging::info_hex(" va", va.0);
        }
        LogEvent::UserFault { env, va } => {
            logging::info("EV: UserFault");
            logging::info_hex(" env", env.raw());
            logging::info_hex(" va", va.0);
        }
        LogEvent::IpcDelivered { from, to, value, page } => {
            logging::info("EV: IpcDelivered");
            logging::info_hex(" from", from.raw());
            logging::info_hex(" to", to.raw());
            logging::info_hex(" value", value);
            logging::info_u64(" page", page as u64);
        }
        LogEvent::Forked { parent, child } => {
            logging::info("EV: Forked");
            logging::info_hex(" parent", parent.raw());
            logging::info_hex(" child", child.raw());
        }
        LogEvent::CpuHalted { cpu } => {
            logging::info("EV: CpuHalted");
            logging::info_u64(" cpu", cpu.0 as u64);
        }
        LogEvent::CpuStarted { cpu } => {
            logging::info("EV: CpuStarted");
            logging::info_u64(" cpu", cpu.0 as u64);
        }
        LogEvent::MonitorEntered { cpu } => {
            logging::info("EV: MonitorEntered");
            logging::info_u64(" cpu", cpu.0 as u64);
        }
    }
}

//
// ──────────────────────────────────────────────
// Kernel（lock + Platform）
// ──────────────────────────────────────────────
//

pub struct Kernel {
    lock: BigKernelLock<KernelState>,
    platform: Arc<dyn Platform>,
}

impl Kernel {
    pub fn boot(config: &KernelConfig, platform: Arc<dyn Platform>, console: Box<dyn Console>) -> Kernel {
        let state = KernelState::new(config, Arc::clone(&platform), console);
        Kernel {
            lock: BigKernelLock::new(state),
            platform,
        }
    }

    /// ブート時に env を 1 つ作る（ENV_CREATE 相当）
    pub fn env_create(&self, image: &[u8], env_type: EnvType) -> Result<EnvId, KernelError> {
        self.with_state(CpuId(0), |ks| ks.env_create(image, env_type))
    }

    /// CPU をスケジューラへ入れる（BSP の最初の sched_yield / AP の mp_main）
    pub fn start(&self, cpu: CpuId) {
        let d = {
            let mut ks = self.lock.lock(cpu);
            ks.start_cpu(cpu)
        };
        self.finish(cpu, d);
    }

    /// trap の入口。lock を放してから resume / halt する。
    pub fn trap(&self, cpu: CpuId, tf: Trapframe) {
        let d = {
            let mut ks = self.lock.lock(cpu);
            ks.trap(cpu, tf)
        };
        self.finish(cpu, d);
    }

    fn finish(&self, cpu: CpuId, d: Dispatch) {
        debug_assert!(!self.lock.holding(cpu));
        match d {
            Dispatch::Resume(tf) => self.platform.resume(cpu, &tf),
            Dispatch::Halt => self.platform.halt(cpu),
        }
    }

    /// KernelState を一時的に借りる（machine / テスト用）
    pub fn with_state<R>(&self, cpu: CpuId, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.lock.with_state(cpu, |ks| {
            ks.this_cpu = cpu;
            f(ks)
        })
    }

    pub fn current_env(&self, cpu: CpuId) -> Option<EnvId> {
        self.lock.with_state(cpu, |ks| ks.curenv_on(cpu))
    }

    pub fn env_alive(&self, id: EnvId) -> bool {
        self.lock.with_state(CpuId(0), |ks| ks.env(id).is_some())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }
}
