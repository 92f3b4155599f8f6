// kernel/src/kernel/fork.rs
//
// 役割:
// - カーネル側の copy-on-write fork（SYS_fork）と、COW 書き込みフォルトの処理。
//
// やること:
// - fork_cow: 親の USTACKTOP 未満を走査し、書けるページを親子とも COW に落として共有する
// - handle_cow_fault: COW ページへの書き込みで、新しいフレームにコピーして W で張り直す
//
// やらないこと:
// - ユーザレベル fork（user::fork が uvpt を読んで sys_page_map で組み立てる）
//
// [不変条件]
// - COW と WRITABLE は同時に立たない。
// - 子への COW マップを先に張り、その後で親を COW に落とす
//   （逆順だと、間に親が書いた内容が子に漏れる）。
// - 例外スタックは共有も COW もしない（子には新しい 0 ページ）。

use alloc::vec::Vec;

use x86_64::structures::idt::PageFaultErrorCode;

use super::{EnvId, EnvStatus, KernelError, KernelState, LogEvent};
use crate::mem::addr::{VirtAddr, PAGE_SIZE};
use crate::mem::layout::{USTACKTOP, UXSTACKTOP};
use crate::mem::paging::{Pte, PteFlags};
use crate::logging;

impl KernelState {
    //
    // fork_cow()
    //
    pub fn fork_cow(&mut self, parent: usize) -> Result<EnvId, KernelError> {
        let parent_id = self.envs[parent].id;
        let child = self.env_alloc(parent_id)?;

        self.set_status(child, EnvStatus::NotRunnable);
        self.envs[child].tf = self.envs[parent].tf;
        self.envs[child].tf.regs.eax = 0;
        self.envs[child].env_type = self.envs[parent].env_type;

        if let Err(e) = self.fork_copy_mappings(parent, child) {
            logging::error("fork_cow: failed, child freed");
            self.env_free(child);
            return Err(e);
        }

        self.envs[child].pgfault_upcall = self.envs[parent].pgfault_upcall;
        self.set_status(child, EnvStatus::Runnable);

        let child_id = self.envs[child].id;
        self.push_event(LogEvent::Forked {
            parent: parent_id,
            child: child_id,
        });
        Ok(child_id)
    }

    fn fork_copy_mappings(&mut self, parent: usize, child: usize) -> Result<(), KernelError> {
        let pspace = self.space_of(parent);
        let cspace = self.space_of(child);

        // 走査中に親の PTE を書き換えるので、先に一覧を取る
        let mut pages: Vec<(VirtAddr, Pte)> = Vec::new();
        pspace.for_each_mapping(&self.pmm, VirtAddr(USTACKTOP), |va, pte| {
            if pte.flags().contains(PteFlags::USER) {
                pages.push((va, pte));
            }
        });

        for (va, pte) in pages {
            let flags = pte.flags();
            let frame = pte.frame();

            if flags.contains(PteFlags::SHARE) {
                let perm = flags & PteFlags::SYSCALL;
                self.with_vm(|pmm, tlb| cspace.insert(pmm, tlb, frame, va, perm))?;
            } else if flags.intersects(PteFlags::WRITABLE | PteFlags::COW) {
                let perm = PteFlags::COW | PteFlags::USER | PteFlags::PRESENT;
                self.with_vm(|pmm, tlb| -> Result<(), KernelError> {
                    cspace.insert(pmm, tlb, frame, va, perm)?;
                    pspace.insert(pmm, tlb, frame, va, perm)?;
                    Ok(())
                })?;
            } else {
                let perm = PteFlags::USER | PteFlags::PRESENT;
                self.with_vm(|pmm, tlb| cspace.insert(pmm, tlb, frame, va, perm))?;
            }
        }

        // 子の例外スタック
        let xstack = VirtAddr(UXSTACKTOP - PAGE_SIZE);
        let frame = self.pmm.allocate(true).ok_or(KernelError::NoMem)?;
        let perm = PteFlags::WRITABLE | PteFlags::USER | PteFlags::PRESENT;
        let r = self.with_vm(|pmm, tlb| cspace.insert(pmm, tlb, frame, xstack, perm));
        if let Err(e) = r {
            self.pmm.release(frame);
            return Err(e.into());
        }
        Ok(())
    }

    //
    // handle_cow_fault(): 前提が崩れていたら Fault（呼び出し側が env を壊す）
    //
    pub fn handle_cow_fault(&mut self, idx: usize, va: VirtAddr, err: u32) -> Result<(), KernelError> {
        let code = PageFaultErrorCode::from_bits_truncate(err as u64);
        if !code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            return Err(KernelError::Fault);
        }

        let space = self.space_of(idx);
        let page = va.align_down();
        let (old, slot) = space.lookup(&self.pmm, page).ok_or(KernelError::Fault)?;
        if !slot.read(&self.pmm).flags().contains(PteFlags::COW) {
            return Err(KernelError::Fault);
        }

        let new = self.pmm.allocate(false).ok_or(KernelError::NoMem)?;
        self.pmm.copy_frame(new, old);

        let perm = PteFlags::WRITABLE | PteFlags::USER | PteFlags::PRESENT;
        let r = self.with_vm(|pmm, tlb| space.insert(pmm, tlb, new, page, perm));
        if let Err(e) = r {
            self.pmm.release(new);
            return Err(e.into());
        }

        let env = self.envs[idx].id;
        self.counters.cow_faults += 1;
        self.push_event(LogEvent::CowFaultServiced { env, va: page });
        Ok(())
    }
}
