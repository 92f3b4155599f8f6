// kernel/src/kernel/env.rs
//
// 役割:
// - env（ユーザ環境）の型と、生成・ロード・破棄・実行の基本操作。
//
// やること:
// - env_alloc: free list から 1 つ取り、ページディレクトリを作り、世代付き id を振る
// - envid2env: id → index（世代違い = 古い id は拒否、checkperm で親子関係も見る）
// - load_program: ELF（goblin）の PT_LOAD を region_alloc してコピーし、スタックを 1 page 張る
// - env_free / env_destroy: 他 CPU で走っている env は DYING にして、次の trap で回収
// - env_run: curenv を切り替えて Dispatch::Resume を返す
//
// やらないこと:
// - スケジューリング方針（sched.rs）
// - fork / COW（fork.rs）
//
// [不変条件]
// - free list は index 昇順で初期化する（最初の env_alloc は envs[0]）。
// - 再利用のたびに世代が進むので、古い id は envid2env で BadEnv になる。

use alloc::vec::Vec;
use core::fmt;

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;

use super::{Dispatch, KernelError, KernelState, LogEvent};
use crate::arch::trapframe::{Trapframe, FL_IOPL_3};
use crate::logging;
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::address_space::Access;
use crate::mem::layout::{USTACKTOP, UTOP, UXSTACKTOP};
use crate::mem::paging::PteFlags;
use crate::mm::pagetable_init;
use crate::types::CpuId;

pub const LOG2NENV: u32 = 10;
pub const NENV: usize = 1 << LOG2NENV;
pub const ENVGENSHIFT: u32 = 12;

/// 世代 | slot index
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub i32);

impl EnvId {
    /// syscall では「自分」、parent_id では「カーネルが作った」
    pub const NONE: EnvId = EnvId(0);

    pub fn index(self) -> usize {
        (self.0 as u32 as usize) & (NENV - 1)
    }

    pub fn raw(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.raw())
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.raw())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    pub fn from_u32(v: u32) -> Option<EnvStatus> {
        Some(match v {
            0 => EnvStatus::Free,
            1 => EnvStatus::Dying,
            2 => EnvStatus::Runnable,
            3 => EnvStatus::Running,
            4 => EnvStatus::NotRunnable,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvType {
    User,
    /// ファイルシステムサーバ（IOPL 3 でディスクに触れる）
    Fs,
}

impl EnvType {
    pub fn as_u32(self) -> u32 {
        match self {
            EnvType::User => 0,
            EnvType::Fs => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<EnvType> {
        match v {
            0 => Some(EnvType::User),
            1 => Some(EnvType::Fs),
            _ => None,
        }
    }
}

/// ページフォルト upcall の入口（ユーザ空間の命令アドレス）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallEntry(pub VirtAddr);

/// env ごとの例外スタックの状態。
/// いまハンドラが例外スタック上で走っているかは depth で持つ（esp の範囲では判定しない）。
/// upcall を配送するたびに enter、pfentry から trap-time 状態へ戻るたびに leave。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExceptionStack {
    depth: u32,
}

impl ExceptionStack {
    pub const BOTTOM: VirtAddr = VirtAddr(UXSTACKTOP - PAGE_SIZE);
    pub const TOP: VirtAddr = VirtAddr(UXSTACKTOP);

    /// ハンドラ実行中（次のフォルトは再帰）
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub(super) fn enter(&mut self) {
        self.depth += 1;
    }

    pub(super) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcState {
    pub recving: bool,
    /// ページを受け取る位置（UTOP 以上ならページは要らない）
    pub dstva: VirtAddr,
    pub value: u32,
    pub from: EnvId,
    /// ページを受け取ったときの権限（受け取らなければ空）
    pub perm: PteFlags,
}

impl IpcState {
    pub const fn idle() -> IpcState {
        IpcState {
            recving: false,
            dstva: VirtAddr(UTOP),
            value: 0,
            from: EnvId::NONE,
            perm: PteFlags::empty(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub env_type: EnvType,
    pub status: EnvStatus,
    pub runs: u32,
    /// 最後に走った CPU
    pub cpu: Option<CpuId>,
    pub pgdir: Option<crate::mem::address_space::AddressSpace>,
    pub tf: Trapframe,
    pub pgfault_upcall: Option<UpcallEntry>,
    pub xstack: ExceptionStack,
    pub ipc: IpcState,

    // free list のリンク
    pub(super) link: Option<usize>,
}

impl Env {
    fn free_slot(link: Option<usize>) -> Env {
        Env {
            id: EnvId::NONE,
            parent_id: EnvId::NONE,
            env_type: EnvType::User,
            status: EnvStatus::Free,
            runs: 0,
            cpu: None,
            pgdir: None,
            tf: Trapframe::default(),
            pgfault_upcall: None,
            xstack: ExceptionStack::default(),
            ipc: IpcState::idle(),
            link,
        }
    }
}

/// env 配列と free list の先頭（index 昇順）
pub(super) fn init_envs() -> (Vec<Env>, Option<usize>) {
    let envs = (0..NENV)
        .map(|i| Env::free_slot(if i + 1 < NENV { Some(i + 1) } else { None }))
        .collect();
    (envs, Some(0))
}

impl KernelState {
    //
    // env_alloc()
    //
    pub fn env_alloc(&mut self, parent_id: EnvId) -> Result<usize, KernelError> {
        let idx = self.env_free_head.ok_or(KernelError::NoFreeEnv)?;

        let kern = self.kern_pgdir;
        let space = pagetable_init::new_env_directory(&mut self.pmm, &kern)?;

        let e = &mut self.envs[idx];
        let mut generation = e.id.0.wrapping_add(1 << ENVGENSHIFT) & !((NENV as i32) - 1);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }

        self.env_free_head = e.link.take();
        e.id = EnvId(generation | idx as i32);
        e.parent_id = parent_id;
        e.env_type = EnvType::User;
        e.status = EnvStatus::Runnable;
        e.runs = 0;
        e.cpu = None;
        e.pgdir = Some(space);
        // eip は load_program / exofork が決める
        e.tf = Trapframe::new_user(0, USTACKTOP);
        e.pgfault_upcall = None;
        e.xstack = ExceptionStack::default();
        e.ipc = IpcState::idle();

        let id = e.id;
        let cur = self.curenv_id().unwrap_or(EnvId::NONE);
        cprintf!(self, "[{}] new env {}\n", cur, id);
        self.push_event(LogEvent::EnvAllocated { env: id, parent: parent_id });
        Ok(idx)
    }

    //
    // envid2env()
    //
    pub fn envid2env(&self, id: EnvId, checkperm: bool) -> Result<usize, KernelError> {
        if id == EnvId::NONE {
            return self.curenv().ok_or(KernelError::BadEnv);
        }

        let idx = id.index();
        let e = &self.envs[idx];
        if e.status == EnvStatus::Free || e.id != id {
            return Err(KernelError::BadEnv);
        }

        if checkperm {
            // 自分自身か、自分の直接の子だけ
            let cur = self.curenv_id().ok_or(KernelError::BadEnv)?;
            if e.id != cur && e.parent_id != cur {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(idx)
    }

    //
    // region_alloc(): [va, va+len) を 0 埋めの新しいページで覆う
    //
    pub fn region_alloc(&mut self, idx: usize, va: VirtAddr, len: u32) -> Result<(), KernelError> {
        let start = va.align_down().0 as u64;
        let end = (va.0 as u64 + len as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        if end > UTOP as u64 {
            return Err(KernelError::Inval);
        }

        let space = self.space_of(idx);
        let mut added: Vec<VirtAddr> = Vec::new();
        let mut cur = start;
        while cur < end {
            let page = VirtAddr(cur as u32);
            cur += PAGE_SIZE as u64;
            if space.lookup(&self.pmm, page).is_some() {
                continue;
            }

            let result = match self.pmm.allocate(true) {
                Some(frame) => {
                    let r = self.with_vm(|pmm, tlb| {
                        space.insert(pmm, tlb, frame, page, PteFlags::USER | PteFlags::WRITABLE)
                    });
                    if r.is_err() {
                        self.pmm.release(frame);
                    }
                    r.map_err(KernelError::from)
                }
                None => Err(KernelError::NoMem),
            };

            if let Err(e) = result {
                // 途中まで張ったものを戻す
                self.with_vm(|pmm, tlb| {
                    for va in &added {
                        space.remove(pmm, tlb, *va);
                    }
                });
                return Err(e);
            }
            added.push(page);
        }
        Ok(())
    }

    //
    // load_program()
    //
    pub fn load_program(&mut self, idx: usize, image: &[u8]) -> Result<(), KernelError> {
        let elf = Elf::parse(image).map_err(|_| KernelError::BadElf)?;
        let space = self.space_of(idx);
        let cpu = self.this_cpu;

        // env のディレクトリで書き込む
        self.platform.lcr3(cpu, space.root().start_address());
        let loaded = self.load_segments(idx, &elf, image);
        self.platform.lcr3(cpu, self.kern_pgdir.root().start_address());
        loaded?;

        self.envs[idx].tf.eip = elf.entry as u32;
        self.region_alloc(idx, VirtAddr(USTACKTOP - PAGE_SIZE), PAGE_SIZE)?;

        logging::info("load_program: done");
        logging::info_hex(" env", self.envs[idx].id.raw());
        logging::info_hex(" entry", elf.entry as u32);
        Ok(())
    }

    fn load_segments(&mut self, idx: usize, elf: &Elf<'_>, image: &[u8]) -> Result<(), KernelError> {
        let space = self.space_of(idx);

        for (n, ph) in elf.program_headers.iter().enumerate() {
            if ph.p_type != PT_LOAD {
                continue;
            }
            if ph.p_filesz > ph.p_memsz {
                panic!(
                    "load_program: segment {} va 0x{:08x} filesz 0x{:x} > memsz 0x{:x}",
                    n, ph.p_vaddr, ph.p_filesz, ph.p_memsz
                );
            }
            let off = ph.p_offset as usize;
            let filesz = ph.p_filesz as usize;
            let data = match off.checked_add(filesz).and_then(|end| image.get(off..end)) {
                Some(d) => d,
                None => panic!(
                    "load_program: segment {} va 0x{:08x} offset 0x{:x} filesz 0x{:x} exceeds image of 0x{:x} bytes",
                    n,
                    ph.p_vaddr,
                    ph.p_offset,
                    ph.p_filesz,
                    image.len()
                ),
            };
            if ph.p_vaddr > u32::MAX as u64 || ph.p_memsz > u32::MAX as u64 {
                return Err(KernelError::BadElf);
            }
            let va = VirtAddr(ph.p_vaddr as u32);
            let memsz = ph.p_memsz as u32;

            self.region_alloc(idx, va, memsz)?;
            space
                .copy_to(&mut self.pmm, va, data, Access::KERNEL_WRITE)
                .map_err(|_| KernelError::Fault)?;

            // 残りは 0（前の segment と同じページを共有している場合に備えて明示的に消す）
            let zeros = [0u8; 256];
            let mut done = filesz as u32;
            while done < memsz {
                let chunk = core::cmp::min(zeros.len() as u32, memsz - done);
                let at = VirtAddr(va.0 + done);
                space
                    .copy_to(&mut self.pmm, at, &zeros[..chunk as usize], Access::KERNEL_WRITE)
                    .map_err(|_| KernelError::Fault)?;
                done += chunk;
            }
        }
        Ok(())
    }

    //
    // env_create()
    //
    pub fn env_create(&mut self, image: &[u8], env_type: EnvType) -> Result<EnvId, KernelError> {
        let idx = self.env_alloc(EnvId::NONE)?;
        if let Err(e) = self.load_program(idx, image) {
            self.env_free(idx);
            return Err(e);
        }
        self.envs[idx].env_type = env_type;
        if env_type == EnvType::Fs {
            self.envs[idx].tf.eflags |= FL_IOPL_3;
        }
        Ok(self.envs[idx].id)
    }

    //
    // env_free()
    //
    pub fn env_free(&mut self, idx: usize) {
        let cpu = self.this_cpu;
        if self.curenv() == Some(idx) {
            self.platform.lcr3(cpu, self.kern_pgdir.root().start_address());
        }

        let id = self.envs[idx].id;
        let cur = self.curenv_id().unwrap_or(EnvId::NONE);
        cprintf!(self, "[{}] free env {}\n", cur, id);

        if let Some(space) = self.envs[idx].pgdir.take() {
            self.with_vm(|pmm, tlb| {
                space.teardown_user(pmm, tlb);
                pmm.decref(space.root());
            });
        }

        let e = &mut self.envs[idx];
        e.status = EnvStatus::Free;
        e.pgfault_upcall = None;
        e.ipc = IpcState::idle();
        e.link = self.env_free_head;
        self.env_free_head = Some(idx);

        self.counters.envs_freed += 1;
        self.push_event(LogEvent::EnvFreed { env: id });
    }

    //
    // env_destroy()
    //
    pub fn env_destroy(&mut self, idx: usize) {
        // 他の CPU で走っている → 次にその CPU が trap したときに回収
        // すでに Dying なら印は付いているので、ここでは何もしない
        let status = self.envs[idx].status;
        if self.curenv() != Some(idx) && status == EnvStatus::Dying {
            return;
        }
        if status == EnvStatus::Running && self.curenv() != Some(idx) {
            self.set_status(idx, EnvStatus::Dying);
            let env = self.envs[idx].id;
            self.push_event(LogEvent::EnvMarkedDying { env });
            return;
        }

        self.env_free(idx);

        if self.curenv() == Some(idx) {
            let cpu = self.this_cpu;
            self.cpus[cpu.0].env = None;
        }
    }

    //
    // env_run()
    //
    pub fn env_run(&mut self, idx: usize) -> Dispatch {
        let cpu = self.this_cpu;

        if let Some(cur) = self.curenv() {
            if cur != idx && self.envs[cur].status == EnvStatus::Running {
                self.envs[cur].status = EnvStatus::Runnable;
            }
        }

        self.cpus[cpu.0].env = Some(idx);
        self.cpus[cpu.0].last_run = Some(idx);

        let space = self.space_of(idx);
        let e = &mut self.envs[idx];
        e.status = EnvStatus::Running;
        e.runs += 1;
        e.cpu = Some(cpu);
        let id = e.id;
        let tf = e.tf;

        self.platform.lcr3(cpu, space.root().start_address());
        self.push_event(LogEvent::EnvRun { cpu, env: id });
        Dispatch::Resume(tf)
    }

    //
    // user_mem_assert(): 失敗したら env を壊して Fault
    //
    pub fn user_mem_assert(
        &mut self,
        idx: usize,
        va: VirtAddr,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let space = self.space_of(idx);
        if let Err(bad) = space.check_user_access(&self.pmm, va, len, perm | PteFlags::USER) {
            let id = self.envs[idx].id;
            cprintf!(self, "[{}] user_mem_check assertion failure for va {:08x}\n", id, bad.0);
            self.env_destroy(idx);
            return Err(KernelError::Fault);
        }
        Ok(())
    }
}
