// kernel/src/main.rs
//
// exokernel-sim: ホスト上で Machine を起動し、デモシナリオを走らせる。
// - fork: ユーザレベル COW fork。親子が同じページに別の値を書き、互いに見えないことを確かめる
// - pingpong: 2 つの env が IPC で値を 1 ずつ増やしながら往復させる
//
// 使い方: exokernel-sim [fork|pingpong|all] [--cpus N] [--verbose | --quiet]
// kernel ログは stderr、ユーザの console 出力は stdout に出す。

use std::io::Write;

use clap::{Parser, ValueEnum};

use exokernel::config::MAX_CPUS;
use exokernel::kernel::EnvId;
use exokernel::machine::{Machine, UserContext, UserError, UserProgram};
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::layout::UTEXT;
use exokernel::mem::paging::PteFlags;
use exokernel::user::fork::fork;
use exokernel::user::image::ProgramImage;
use exokernel::user::ipc::{ipc_recv_begin, ipc_recv_finish, ipc_send};
use exokernel::user::syscall::{exit, puts, sys_getenvid};
use exokernel::{EnvType, KernelConfig};

// ─────────────────────────────────────────────
// stderr への Logger（log facade の出力先）
// ─────────────────────────────────────────────

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                std::io::stderr(),
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// ─────────────────────────────────────────────
// fork シナリオ
// ─────────────────────────────────────────────

const DATA_VA: u32 = UTEXT + PAGE_SIZE;

fn demo_image() -> Vec<u8> {
    ProgramImage::new(UTEXT + 0x20)
        .text(UTEXT, &[0x90; 64])
        .data(DATA_VA, &[0u8; 16], PAGE_SIZE)
        .build()
}

#[derive(Default)]
struct ForkParent {
    forked: bool,
}

impl UserProgram for ForkParent {
    fn step(&mut self, ctx: &mut UserContext<'_>) -> Result<(), UserError> {
        if !self.forked {
            ctx.store_u8(VirtAddr(DATA_VA), 0xAA)?;
            let child = fork(ctx, Box::new(ForkChild))?;
            self.forked = true;
            puts(ctx, &format!("[{}] forked child {}\n", ctx.env_id(), child))?;
            return Ok(());
        }
        let v = ctx.load_u8(VirtAddr(DATA_VA))?;
        puts(ctx, &format!("[{}] parent sees {:#04x}\n", ctx.env_id(), v))?;
        exit(ctx)
    }
}

struct ForkChild;

impl UserProgram for ForkChild {
    fn step(&mut self, ctx: &mut UserContext<'_>) -> Result<(), UserError> {
        ctx.store_u8(VirtAddr(DATA_VA), 0xBB)?;
        let v = ctx.load_u8(VirtAddr(DATA_VA))?;
        puts(ctx, &format!("[{}] child sees {:#04x}\n", ctx.env_id(), v))?;
        exit(ctx)
    }
}

// ─────────────────────────────────────────────
// ping-pong シナリオ
// ─────────────────────────────────────────────

const ROUNDS: u32 = 10;

enum PingState {
    Send { to: EnvId, value: u32 },
    Recv,
    Waiting,
}

struct Pinger {
    state: PingState,
}

impl Pinger {
    fn starter(peer: EnvId) -> Self {
        Pinger {
            state: PingState::Send { to: peer, value: 0 },
        }
    }

    fn responder() -> Self {
        Pinger {
            state: PingState::Recv,
        }
    }
}

impl UserProgram for Pinger {
    fn step(&mut self, ctx: &mut UserContext<'_>) -> Result<(), UserError> {
        match self.state {
            PingState::Send { to, value } => {
                ipc_send(ctx, to, value, None, PteFlags::empty())?;
                if value >= ROUNDS {
                    return exit(ctx);
                }
                self.state = PingState::Recv;
                Ok(())
            }
            PingState::Recv => {
                self.state = PingState::Waiting;
                ipc_recv_begin(ctx, None)
            }
            PingState::Waiting => {
                let msg = ipc_recv_finish(ctx)?;
                let me = sys_getenvid(ctx)?;
                puts(ctx, &format!("{} got {} from {}\n", me, msg.value, msg.from))?;
                if msg.value >= ROUNDS {
                    return exit(ctx);
                }
                self.state = PingState::Send {
                    to: msg.from,
                    value: msg.value + 1,
                };
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────
// 実行
// ─────────────────────────────────────────────

fn run_machine(name: &str, mut machine: Machine) {
    machine.start();
    let steps = machine.run(100_000);

    let out = machine.console().take_output();
    print!("{}", String::from_utf8_lossy(&out));

    let violations = machine
        .kernel()
        .with_state(exokernel::CpuId(0), |ks| {
            ks.dump_events();
            ks.debug_check_invariants()
        });
    log::warn!(target: "sim", "{}: {} steps, {} invariant violations", name, steps, violations);
}

fn run_fork(ncpu: usize) -> Result<(), exokernel::KernelError> {
    let mut machine = Machine::new(KernelConfig::default().with_cpus(ncpu));
    let image = demo_image();
    machine.spawn(&image, EnvType::User, Box::new(ForkParent::default()))?;
    run_machine("fork", machine);
    Ok(())
}

fn run_pingpong(ncpu: usize) -> Result<(), exokernel::KernelError> {
    let mut machine = Machine::new(KernelConfig::default().with_cpus(ncpu));
    let image = demo_image();
    let pong = machine.spawn(&image, EnvType::User, Box::new(Pinger::responder()))?;
    machine.spawn(&image, EnvType::User, Box::new(Pinger::starter(pong)))?;
    run_machine("pingpong", machine);
    Ok(())
}

/// Hosted exokernel simulator: boots the kernel and runs demo scenarios
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario to run
    #[arg(value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Number of CPUs to boot
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=MAX_CPUS as i64))]
    cpus: u8,

    /// Show kernel info logs on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Silence kernel logs entirely
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    Fork,
    Pingpong,
    All,
}

fn main() {
    let args = Args::parse();

    init_logger(args.verbose);
    if args.quiet {
        exokernel::logging::set_enabled(false);
    }

    let ncpu = args.cpus as usize;
    let result = match args.scenario {
        Scenario::Fork => run_fork(ncpu),
        Scenario::Pingpong => run_pingpong(ncpu),
        Scenario::All => run_fork(ncpu).and_then(|_| run_pingpong(ncpu)),
    };

    if let Err(e) = result {
        eprintln!("exokernel-sim: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_every_scenario_on_one_cpu() {
        let args = Args::try_parse_from(["exokernel-sim"]).unwrap();
        assert_eq!(args.scenario, Scenario::All);
        assert_eq!(args.cpus, 1);
        assert!(!args.verbose && !args.quiet);
    }

    #[test]
    fn malformed_cpu_count_is_an_error() {
        assert!(Args::try_parse_from(["exokernel-sim", "--cpus", "two"]).is_err());
        assert!(Args::try_parse_from(["exokernel-sim", "--cpus", "0"]).is_err());
        assert!(Args::try_parse_from(["exokernel-sim", "--cpus", "9"]).is_err());
        let args = Args::try_parse_from(["exokernel-sim", "fork", "--cpus", "4"]).unwrap();
        assert_eq!((args.scenario, args.cpus), (Scenario::Fork, 4));
    }

    #[test]
    fn unknown_scenario_and_conflicting_flags_are_errors() {
        assert!(Args::try_parse_from(["exokernel-sim", "bogus"]).is_err());
        assert!(Args::try_parse_from(["exokernel-sim", "-v", "-q"]).is_err());
    }
}
