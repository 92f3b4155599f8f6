// テスト共通: マシンの組み立てと小さなユーザプログラム
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use exokernel::machine::{Machine, UserContext, UserError, UserProgram};
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::layout::UTEXT;
use exokernel::mem::paging::PteFlags;
use exokernel::user::image::ProgramImage;
use exokernel::user::syscall::exit;
use exokernel::{CpuId, EnvId, KernelConfig, KernelState};

pub const ENTRY: u32 = UTEXT + 0x20;
/// 初期化済みデータ（"hello"）とその後ろの bss 1 page
pub const DATA_VA: u32 = UTEXT + PAGE_SIZE;
pub const DATA: &[u8] = b"hello";

pub const URW: PteFlags = PteFlags::PRESENT
    .union(PteFlags::USER)
    .union(PteFlags::WRITABLE);
pub const UR: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);

pub fn image() -> Vec<u8> {
    ProgramImage::new(ENTRY)
        .text(UTEXT, &[0x90; 64])
        .data(DATA_VA, DATA, 2 * PAGE_SIZE)
        .build()
}

pub fn machine(ncpu: usize) -> Machine {
    Machine::new(KernelConfig::default().with_cpus(ncpu))
}

/// クロージャを UserProgram として包む（引数の型をここで決める）
pub fn program<F>(f: F) -> Box<dyn UserProgram>
where
    F: FnMut(&mut UserContext<'_>) -> Result<(), UserError> + Send + 'static,
{
    Box::new(f)
}

/// すぐに exit するプログラム
pub fn exiting() -> Box<dyn UserProgram> {
    program(|ctx| exit(ctx))
}

/// 何もせずに走り続けるプログラム（timer でしか cpu を手放さない）
pub fn spinning() -> Box<dyn UserProgram> {
    program(|_ctx| Ok(()))
}

/// 複数のプログラムから結果を集める
#[derive(Clone)]
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Recorder(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, v: T) {
        self.0.lock().unwrap().push(v);
    }

    pub fn get(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

pub fn with_state<R>(m: &Machine, f: impl FnOnce(&mut KernelState) -> R) -> R {
    m.kernel().with_state(CpuId(0), f)
}

/// env の va にある PTE の flags（無ければ None）
pub fn pte_flags(ks: &KernelState, env: EnvId, va: u32) -> Option<PteFlags> {
    let space = ks.env(env)?.pgdir?;
    let pte = space.read_pte(ks.pmm(), VirtAddr(va));
    pte.is_present().then(|| pte.flags())
}

/// env の va にマップされているフレーム番号
pub fn frame_of(ks: &KernelState, env: EnvId, va: u32) -> Option<u32> {
    let space = ks.env(env)?.pgdir?;
    space.lookup(ks.pmm(), VirtAddr(va)).map(|(f, _)| f.number)
}
