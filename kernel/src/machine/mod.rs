// kernel/src/machine/mod.rs
//
// 役割:
// - ホスト上で「x86 マシン + ユーザ空間」の代わりをする。
// - HostedPlatform の上で Kernel を起動し、CPU ごとに curenv のプログラムを 1 step ずつ進める。
//
// やること:
// - env ごとに UserProgram（ステートマシン）を登録し、その env が走っている CPU で step させる
// - halt 中の CPU は、走れる env が現れたら timer 割り込みで起こす
// - timer_every を設定すると、その step 数ごとにユーザ実行中の CPU へ timer を入れる
//
// やらないこと:
// - 本物の並列実行（CPU は番号順に 1 step ずつ回す）
//
// 設計方針:
// - ユーザプログラムは step が返るたびに「次にどこから続けるか」を自分で覚えておく。
//   ブロックする syscall（ipc_recv など）は Err(Descheduled) で step を抜け、
//   その env が次に走ったときの step で続きを処理する。

mod context;

pub use context::UserContext;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::hosted::HostedPlatform;
use crate::arch::interrupts::{IRQ_OFFSET, IRQ_TIMER};
use crate::arch::trapframe::{Trapframe, UTrapframe};
use crate::config::KernelConfig;
use crate::dev::console::BufferConsole;
use crate::dev::ide::RamDisk;
use crate::kernel::{EnvId, EnvStatus, EnvType, Kernel, KernelError, Syscall};
use crate::logging;
use crate::types::CpuId;

/// ユーザ側の失敗
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserError {
    /// この env はもう cpu 上に居ない（まだ生きている）
    Descheduled,
    /// この env は破棄された
    Destroyed,
    /// syscall が負の値を返した
    Kernel(KernelError),
    /// ユーザライブラリの panic（env は exit させられる）
    Panic(&'static str),
}

impl From<KernelError> for UserError {
    fn from(e: KernelError) -> Self {
        UserError::Kernel(e)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserError::Descheduled => f.write_str("descheduled"),
            UserError::Destroyed => f.write_str("destroyed"),
            UserError::Kernel(e) => write!(f, "{}", e),
            UserError::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// env の中で走るユーザプログラム
pub trait UserProgram: Send {
    fn step(&mut self, ctx: &mut UserContext<'_>) -> Result<(), UserError>;
}

impl<F> UserProgram for F
where
    F: FnMut(&mut UserContext<'_>) -> Result<(), UserError> + Send,
{
    fn step(&mut self, ctx: &mut UserContext<'_>) -> Result<(), UserError> {
        self(ctx)
    }
}

/// ユーザのページフォルトハンドラ（_pgfault_handler 相当）
pub type PgfaultHandler = fn(&mut UserContext<'_>, &UTrapframe) -> Result<(), UserError>;

/// env ごとのユーザランタイム状態（ユーザ空間のグローバル変数の代わり）
#[derive(Clone, Copy, Default)]
pub struct EnvRuntime {
    pub pgfault: Option<PgfaultHandler>,
}

/// UserContext から触るマシン本体
pub struct MachineCore {
    kernel: Kernel,
    platform: Arc<HostedPlatform>,
    disk: RamDisk,
    runtimes: BTreeMap<EnvId, EnvRuntime>,
    // step 中に adopt されたプログラム（step の後で programs に移す）
    adopted: Vec<(EnvId, Box<dyn UserProgram>)>,
}

impl MachineCore {
    fn any_runnable(&self) -> bool {
        self.kernel.with_state(CpuId(0), |ks| {
            ks.envs().iter().any(|e| e.status == EnvStatus::Runnable)
        })
    }
}

pub struct Machine {
    core: MachineCore,
    console: BufferConsole,
    programs: BTreeMap<EnvId, Box<dyn UserProgram>>,
    ncpu: usize,
    timer_every: Option<u32>,
    ticks: Vec<u32>,
    steps: u64,
}

impl Machine {
    pub fn new(config: KernelConfig) -> Machine {
        let platform = Arc::new(HostedPlatform::new());
        let console = BufferConsole::new();
        let kernel = Kernel::boot(&config, platform.clone(), Box::new(console.clone()));
        Machine {
            core: MachineCore {
                kernel,
                platform,
                disk: RamDisk::new(0),
                runtimes: BTreeMap::new(),
                adopted: Vec::new(),
            },
            console,
            programs: BTreeMap::new(),
            ncpu: config.ncpu,
            timer_every: None,
            ticks: alloc::vec![0; config.ncpu],
            steps: 0,
        }
    }

    pub fn with_disk(mut self, disk: RamDisk) -> Machine {
        self.core.disk = disk;
        self
    }

    pub fn set_timer_every(&mut self, every: Option<u32>) {
        self.timer_every = every.filter(|&n| n > 0);
    }

    pub fn kernel(&self) -> &Kernel {
        &self.core.kernel
    }

    pub fn platform(&self) -> &Arc<HostedPlatform> {
        &self.core.platform
    }

    pub fn console(&self) -> &BufferConsole {
        &self.console
    }

    pub fn disk(&self) -> &RamDisk {
        &self.core.disk
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// ELF から env を作り、そこで走るプログラムを登録する
    pub fn spawn(
        &mut self,
        image: &[u8],
        env_type: EnvType,
        program: Box<dyn UserProgram>,
    ) -> Result<EnvId, KernelError> {
        let id = self.core.kernel.env_create(image, env_type)?;
        self.programs.insert(id, program);
        Ok(id)
    }

    /// 全 CPU をスケジューラへ入れる
    pub fn start(&mut self) {
        for c in 0..self.ncpu {
            self.core.kernel.start(CpuId(c));
        }
    }

    /// cpu に timer 割り込みを入れる（ユーザ実行中でも halt 中でも）
    pub fn timer_interrupt(&mut self, cpu: CpuId) {
        let tf = match self.core.platform.take_live_context(cpu) {
            Some(mut tf) => {
                tf.trapno = IRQ_OFFSET + IRQ_TIMER;
                tf.err = 0;
                tf
            }
            None => Trapframe::new_kernel(IRQ_OFFSET + IRQ_TIMER),
        };
        self.core.kernel.trap(cpu, tf);
        self.after_step();
    }

    /// cpu で走っている env として f を実行する（テストで途中に割り込むため）
    pub fn with_env_context<R>(
        &mut self,
        cpu: CpuId,
        f: impl FnOnce(&mut UserContext<'_>) -> R,
    ) -> Option<R> {
        let env = self.core.kernel.current_env(cpu)?;
        self.core.platform.live_context(cpu)?;
        let r = {
            let mut ctx = UserContext::new(&mut self.core, cpu, env);
            f(&mut ctx)
        };
        self.after_step();
        Some(r)
    }

    /// 各 CPU を 1 step 進める。何も起きなければ false。
    pub fn step(&mut self) -> bool {
        let mut progressed = false;

        for c in 0..self.ncpu {
            let cpu = CpuId(c);

            if self.core.platform.live_context(cpu).is_none() {
                if self.core.any_runnable() {
                    self.timer_interrupt(cpu);
                    progressed = true;
                }
                continue;
            }

            if let Some(every) = self.timer_every {
                self.ticks[c] += 1;
                if self.ticks[c] % every == 0 {
                    self.timer_interrupt(cpu);
                    progressed = true;
                    continue;
                }
            }

            let Some(env) = self.core.kernel.current_env(cpu) else {
                continue;
            };
            progressed = true;
            self.steps += 1;
            self.run_program(cpu, env);
        }

        progressed
    }

    /// 進まなくなるか max_steps に達するまで回す。回した回数を返す。
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut n = 0;
        while n < max_steps && self.step() {
            n += 1;
        }
        n
    }

    fn run_program(&mut self, cpu: CpuId, env: EnvId) {
        let Some(mut program) = self.programs.remove(&env) else {
            // プログラムの無い env は即座に終わらせる
            logging::error("machine: env has no program; destroying");
            logging::info_hex(" env", env.raw());
            let mut ctx = UserContext::new(&mut self.core, cpu, env);
            let _ = ctx.syscall(Syscall::EnvDestroy { env: EnvId::NONE });
            self.after_step();
            return;
        };

        let result = {
            let mut ctx = UserContext::new(&mut self.core, cpu, env);
            let r = program.step(&mut ctx);
            match r {
                Err(UserError::Panic(msg)) => {
                    self.console_note(env, msg);
                    let mut ctx = UserContext::new(&mut self.core, cpu, env);
                    let _ = ctx.syscall(Syscall::EnvDestroy { env: EnvId::NONE });
                    r
                }
                Err(UserError::Kernel(e)) => {
                    logging::error("machine: user program failed");
                    logging::info_hex(" env", env.raw());
                    logging::info_kv(" code", e.code().unsigned_abs() as u64);
                    let mut ctx = UserContext::new(&mut self.core, cpu, env);
                    let _ = ctx.syscall(Syscall::EnvDestroy { env: EnvId::NONE });
                    r
                }
                other => other,
            }
        };

        if result != Err(UserError::Destroyed) && self.core.kernel.env_alive(env) {
            self.programs.insert(env, program);
        }
        self.after_step();
    }

    fn console_note(&mut self, env: EnvId, msg: &str) {
        self.core.kernel.with_state(CpuId(0), |ks| {
            ks.cprint(format_args!("[{}] user panic: {}\n", env, msg));
        });
    }

    /// adopt されたプログラムを登録し、消えた env の後始末をする
    fn after_step(&mut self) {
        for (id, program) in self.core.adopted.drain(..) {
            self.programs.insert(id, program);
        }
        let kernel = &self.core.kernel;
        self.programs.retain(|id, _| kernel.env_alive(*id));
        self.core.runtimes.retain(|id, _| kernel.env_alive(*id));
    }
}
