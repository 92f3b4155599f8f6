// kernel/src/kernel/lock.rs
//
// 役割:
// - KernelState 全体を守る big kernel lock。
// - カーネルコードを走らせる CPU は必ずこの guard を持っている。
//
// やること:
// - spin::Mutex で排他し、いま誰が持っているか（CPU 番号）を記録する。
// - with_state(): 外側（machine / テスト）から KernelState を一時的に借りる唯一の入口。
//
// やらないこと:
// - 再入（同じ CPU が二重に取ったら spin で止まる＝バグ）
// - 公平性（ticket 順序）

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::types::CpuId;

const NO_HOLDER: usize = usize::MAX;

pub struct BigKernelLock<T> {
    inner: Mutex<T>,
    holder: AtomicUsize,
}

impl<T> BigKernelLock<T> {
    pub fn new(value: T) -> Self {
        BigKernelLock {
            inner: Mutex::new(value),
            holder: AtomicUsize::new(NO_HOLDER),
        }
    }

    pub fn lock(&self, cpu: CpuId) -> KernelGuard<'_, T> {
        let guard = self.inner.lock();
        self.holder.store(cpu.0, Ordering::SeqCst);
        KernelGuard {
            guard,
            holder: &self.holder,
            cpu,
        }
    }

    /// cpu がいま lock を持っているか
    pub fn holding(&self, cpu: CpuId) -> bool {
        self.holder.load(Ordering::SeqCst) == cpu.0
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// lock を取り、state を借りて f を実行する
    pub fn with_state<R>(&self, cpu: CpuId, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock(cpu);
        f(&mut g)
    }
}

pub struct KernelGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    holder: &'a AtomicUsize,
    cpu: CpuId,
}

impl<T> KernelGuard<'_, T> {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<T> Deref for KernelGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        debug_assert_eq!(self.holder.load(Ordering::SeqCst), self.cpu.0);
        &self.guard
    }
}

impl<T> DerefMut for KernelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        debug_assert_eq!(self.holder.load(Ordering::SeqCst), self.cpu.0);
        &mut self.guard
    }
}

impl<T> Drop for KernelGuard<'_, T> {
    fn drop(&mut self) {
        // MutexGuard が外れる前に holder を消す
        self.holder.store(NO_HOLDER, Ordering::SeqCst);
    }
}
