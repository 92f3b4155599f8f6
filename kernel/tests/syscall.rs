mod common;

use common::*;
use exokernel::arch::interrupts::{IRQ_KBD, IRQ_OFFSET};
use exokernel::arch::trapframe::{Trapframe, FL_IF, FL_IOPL_3, GD_KT};
use exokernel::kernel::syscall::*;
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::address_space::Access;
use exokernel::mem::layout::UTOP;
use exokernel::mem::paging::PteFlags;
use exokernel::user::syscall::{sys_cgetc, sys_getenvid, sys_page_alloc};
use exokernel::{CpuId, EnvId, EnvStatus, EnvType, KernelError, KernelState, UserError};

const VA: u32 = 0x0040_0000;

fn code(e: KernelError) -> i32 {
    e.code()
}

/// curenv を 1 つ走らせた状態を作る
fn running_env(ks: &mut KernelState) -> EnvId {
    let id = ks.env_create(&image(), EnvType::User).unwrap();
    ks.env_run(id.index());
    id
}

fn exofork(ks: &mut KernelState) -> EnvId {
    let r = ks.syscall(SYS_EXOFORK, 0, 0, 0, 0, 0);
    assert!(r > 0, "exofork failed: {}", r);
    EnvId(r)
}

#[test]
fn decode_and_args_agree() {
    let sc = Syscall::PageMap {
        src_env: EnvId(0x1000),
        src_va: VirtAddr(0x1000),
        dst_env: EnvId(0x1001),
        dst_va: VirtAddr(0x2000),
        perm: URW.bits(),
    };
    let [a1, a2, a3, a4, a5] = sc.args();
    assert_eq!(Syscall::decode(sc.number(), a1, a2, a3, a4, a5), Some(sc));
    assert_eq!(Syscall::decode(99, 0, 0, 0, 0, 0), None);
}

#[test]
fn unknown_syscall_is_inval() {
    let m = machine(1);
    with_state(&m, |ks| {
        running_env(ks);
        assert_eq!(ks.syscall(99, 0, 0, 0, 0, 0), code(KernelError::Inval));
    });
}

#[test]
fn syscall_without_curenv_is_bad_env() {
    let m = machine(1);
    with_state(&m, |ks| {
        assert_eq!(ks.syscall(SYS_GETENVID, 0, 0, 0, 0, 0), code(KernelError::BadEnv));
    });
}

#[test]
fn getenvid_returns_curenv() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        assert_eq!(ks.syscall(SYS_GETENVID, 0, 0, 0, 0, 0), id.0);
    });
}

#[test]
fn page_alloc_validates_va_and_perm() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        let inval = code(KernelError::Inval);

        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, UTOP, URW.bits(), 0, 0), inval);
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA + 4, URW.bits(), 0, 0), inval);
        // U が無い
        let no_user = (PteFlags::PRESENT | PteFlags::WRITABLE).bits();
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, no_user, 0, 0), inval);
        // PTE_SYSCALL 以外のビット
        let dirty = (URW | PteFlags::DIRTY).bits();
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, dirty, 0, 0), inval);
        assert!(pte_flags(ks, id, VA).is_none());

        // 知らない env
        let stale = EnvId(0x7000 | 5).raw();
        assert_eq!(
            ks.syscall(SYS_PAGE_ALLOC, stale, VA, URW.bits(), 0, 0),
            code(KernelError::BadEnv)
        );
    });
}

#[test]
fn page_alloc_maps_a_zeroed_page() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        let perm = URW | PteFlags::SHARE;
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, perm.bits(), 0, 0), 0);

        let flags = pte_flags(ks, id, VA).unwrap();
        assert!(flags.contains(perm));
        let frame = frame_of(ks, id, VA).unwrap();
        let f = exokernel::mem::addr::PhysFrame::from_index(frame);
        assert!(ks.pmm().frame_bytes(f).iter().all(|&b| b == 0));
        assert_eq!(ks.pmm().ref_count(f), 1);
    });
}

#[test]
fn page_alloc_replaces_existing_mapping() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        let free = ks.pmm().free_frames();
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);
        let after_first = ks.pmm().free_frames();
        // 新しいページテーブルの分も減る
        assert!(after_first < free);

        let first = frame_of(ks, id, VA).unwrap();
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);
        assert_ne!(frame_of(ks, id, VA), Some(first));
        assert_eq!(ks.pmm().free_frames(), after_first);
    });
}

#[test]
fn page_map_shares_frames_and_enforces_write_rule() {
    let m = machine(1);
    with_state(&m, |ks| {
        let parent = running_env(ks);
        let child = exofork(ks);
        let inval = code(KernelError::Inval);

        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, UR.bits(), 0, 0), 0);
        // 読み取り専用のページを W で渡すことはできない
        assert_eq!(
            ks.syscall(SYS_PAGE_MAP, 0, VA, child.raw(), VA, URW.bits()),
            inval
        );
        // 元がマップされていない
        assert_eq!(
            ks.syscall(SYS_PAGE_MAP, 0, VA + PAGE_SIZE, child.raw(), VA, UR.bits()),
            inval
        );
        // 境界違反
        assert_eq!(
            ks.syscall(SYS_PAGE_MAP, 0, VA, child.raw(), UTOP, UR.bits()),
            inval
        );

        assert_eq!(ks.syscall(SYS_PAGE_MAP, 0, VA, child.raw(), VA + PAGE_SIZE, UR.bits()), 0);
        let f = frame_of(ks, parent, VA).unwrap();
        assert_eq!(frame_of(ks, child, VA + PAGE_SIZE), Some(f));
        assert_eq!(
            ks.pmm().ref_count(exokernel::mem::addr::PhysFrame::from_index(f)),
            2
        );
    });
}

#[test]
fn page_map_requires_parenthood_on_both_sides() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let stranger = ks.env_create(&img, EnvType::User).unwrap();
        running_env(ks);
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);
        assert_eq!(
            ks.syscall(SYS_PAGE_MAP, 0, VA, stranger.raw(), VA, URW.bits()),
            code(KernelError::BadEnv)
        );
        assert!(pte_flags(ks, stranger, VA).is_none());
    });
}

#[test]
fn page_unmap_is_idempotent() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        let free = ks.pmm().free_frames();
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);
        assert_eq!(ks.syscall(SYS_PAGE_UNMAP, 0, VA, 0, 0, 0), 0);
        assert!(pte_flags(ks, id, VA).is_none());
        assert_eq!(ks.syscall(SYS_PAGE_UNMAP, 0, VA, 0, 0, 0), 0);
        // ページテーブル 1 枚だけ残る
        assert_eq!(ks.pmm().free_frames(), free - 1);

        assert_eq!(
            ks.syscall(SYS_PAGE_UNMAP, 0, VA + 1, 0, 0, 0),
            code(KernelError::Inval)
        );
    });
}

#[test]
fn set_status_accepts_only_runnable_and_not_runnable() {
    let m = machine(1);
    with_state(&m, |ks| {
        running_env(ks);
        let child = exofork(ks);
        let inval = code(KernelError::Inval);

        assert_eq!(ks.syscall(SYS_ENV_SET_STATUS, child.raw(), EnvStatus::Dying as u32, 0, 0, 0), inval);
        assert_eq!(ks.syscall(SYS_ENV_SET_STATUS, child.raw(), EnvStatus::Free as u32, 0, 0, 0), inval);
        assert_eq!(ks.syscall(SYS_ENV_SET_STATUS, child.raw(), 77, 0, 0, 0), inval);
        assert_eq!(ks.env(child).unwrap().status, EnvStatus::NotRunnable);

        assert_eq!(ks.syscall(SYS_ENV_SET_STATUS, child.raw(), EnvStatus::Runnable as u32, 0, 0, 0), 0);
        assert_eq!(ks.env(child).unwrap().status, EnvStatus::Runnable);
    });
}

#[test]
fn exofork_child_copies_registers_and_returns_zero() {
    let m = machine(1);
    with_state(&m, |ks| {
        let parent = running_env(ks);
        let child = exofork(ks);
        let p = ks.env(parent).unwrap().tf;
        let c = ks.env(child).unwrap().tf;
        assert_eq!(c.eip, p.eip);
        assert_eq!(c.esp, p.esp);
        assert_eq!(c.regs.eax, 0);
        // 子のアドレス空間は空
        assert_eq!(ks.env(child).unwrap().pgdir.unwrap().mapping_count(ks.pmm()), 0);
    });
}

#[test]
fn set_trapframe_forces_user_mode_and_clears_iopl() {
    let m = machine(1);
    with_state(&m, |ks| {
        let parent = running_env(ks);
        let child = exofork(ks);
        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);

        let mut tf = Trapframe::new_kernel(0);
        tf.cs = GD_KT;
        tf.eflags = FL_IOPL_3;
        tf.eip = 0x0080_1234;
        tf.esp = 0x0090_0000;
        let space = ks.env(parent).unwrap().pgdir.unwrap();
        space
            .copy_to(ks.pmm_mut(), VirtAddr(VA), &tf.to_bytes(), Access::KERNEL_WRITE)
            .unwrap();

        assert_eq!(ks.syscall(SYS_ENV_SET_TRAPFRAME, child.raw(), VA, 0, 0, 0), 0);
        let got = ks.env(child).unwrap().tf;
        assert!(got.from_user());
        assert_ne!(got.eflags & FL_IF, 0);
        assert_eq!(got.iopl(), 0);
        assert_eq!(got.eip, 0x0080_1234);
        assert_eq!(got.esp, 0x0090_0000);
    });
}

#[test]
fn set_pgfault_upcall_zero_clears_it() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        assert_eq!(ks.syscall(SYS_ENV_SET_PGFAULT_UPCALL, 0, 0x0080_0020, 0, 0, 0), 0);
        assert!(ks.env(id).unwrap().pgfault_upcall.is_some());
        assert_eq!(ks.syscall(SYS_ENV_SET_PGFAULT_UPCALL, 0, 0, 0, 0, 0), 0);
        assert!(ks.env(id).unwrap().pgfault_upcall.is_none());
    });
}

#[test]
fn cputs_writes_user_bytes_to_console() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        let space = ks.env(id).unwrap().pgdir.unwrap();
        space
            .copy_to(ks.pmm_mut(), VirtAddr(DATA_VA), b"hey there", Access::KERNEL_WRITE)
            .unwrap();
        assert_eq!(ks.syscall(SYS_CPUTS, DATA_VA, 9, 0, 0, 0), 0);
    });
    assert!(m.console().output_string().ends_with("hey there"));
}

#[test]
fn cputs_with_bad_pointer_destroys_the_caller() {
    let m = machine(1);
    let id = with_state(&m, |ks| {
        let id = running_env(ks);
        assert_eq!(ks.syscall(SYS_CPUTS, VA, 4, 0, 0, 0), code(KernelError::Fault));
        assert!(ks.env(id).is_none());
        assert_eq!(ks.curenv_on(CpuId(0)), None);
        id
    });
    let out = m.console().output_string();
    assert!(out.contains(&format!("[{}] user_mem_check assertion failure for va 00400000", id)));
    // curenv 自身が free したことになる
    assert!(out.contains(&format!("[{}] free env {}", id, id)));
}

#[test]
fn cputs_of_kernel_memory_is_refused() {
    let m = machine(1);
    with_state(&m, |ks| {
        let id = running_env(ks);
        assert_eq!(
            ks.syscall(SYS_CPUTS, exokernel::mem::layout::KERNBASE, 4, 0, 0, 0),
            code(KernelError::Fault)
        );
        assert!(ks.env(id).is_none());
    });
}

#[test]
fn env_destroy_prints_who_did_what() {
    let m = machine(1);
    let (parent, child) = with_state(&m, |ks| {
        let parent = running_env(ks);
        let child = exofork(ks);
        assert_eq!(ks.syscall(SYS_ENV_DESTROY, child.raw(), 0, 0, 0, 0), 0);
        assert!(ks.env(child).is_none());
        assert_eq!(ks.syscall(SYS_ENV_DESTROY, 0, 0, 0, 0, 0), 0);
        assert!(ks.env(parent).is_none());
        (parent, child)
    });
    let out = m.console().output_string();
    assert!(out.contains(&format!("[{}] destroying {}\n", parent, child)));
    assert!(out.contains(&format!("[{}] exiting gracefully\n", parent)));
}

#[test]
fn cgetc_reads_console_input_after_keyboard_interrupt() {
    let mut m = machine(1);
    m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();

    m.console().push_input(b"x");
    let got = m
        .with_env_context(CpuId(0), |ctx| (sys_cgetc(ctx).unwrap(), sys_cgetc(ctx).unwrap()))
        .unwrap();
    assert_eq!(got, (b'x', 0));

    // デバイス側の入力は KBD 割り込みまで見えない
    m.console().push_device_input(b"k");
    assert_eq!(m.with_env_context(CpuId(0), |ctx| sys_cgetc(ctx).unwrap()), Some(0));

    let mut tf = m.platform().take_live_context(CpuId(0)).unwrap();
    tf.trapno = IRQ_OFFSET + IRQ_KBD;
    m.kernel().trap(CpuId(0), tf);
    assert_eq!(m.with_env_context(CpuId(0), |ctx| sys_cgetc(ctx).unwrap()), Some(b'k'));
}

#[test]
fn syscall_return_value_lands_in_eax() {
    let mut m = machine(1);
    let id = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();

    let r = m
        .with_env_context(CpuId(0), |ctx| {
            let me = sys_getenvid(ctx).unwrap();
            (me, ctx.live_context().unwrap().regs.eax)
        })
        .unwrap();
    assert_eq!(r, (id, id.raw()));

    let err = m
        .with_env_context(CpuId(0), |ctx| sys_page_alloc(ctx, EnvId::NONE, VirtAddr(UTOP), URW))
        .unwrap();
    assert_eq!(err, Err(UserError::Kernel(KernelError::Inval)));
}

#[test]
fn cow_together_with_write_is_refused_everywhere() {
    let m = machine(1);
    with_state(&m, |ks| {
        let parent = running_env(ks);
        let child = exofork(ks);
        let inval = code(KernelError::Inval);
        let cow_w = (URW | PteFlags::COW).bits();
        let before = ks.pmm().free_frames();

        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, cow_w, 0, 0), inval);
        assert!(pte_flags(ks, parent, VA).is_none());
        assert_eq!(ks.pmm().free_frames(), before);

        assert_eq!(ks.syscall(SYS_PAGE_ALLOC, 0, VA, URW.bits(), 0, 0), 0);
        assert_eq!(
            ks.syscall(SYS_PAGE_MAP, 0, VA, child.raw(), VA, cow_w),
            inval
        );
        assert!(pte_flags(ks, child, VA).is_none());

        // COW だけなら fork の duppage と同じ形なので通る
        let cow = (UR | PteFlags::COW).bits();
        assert_eq!(ks.syscall(SYS_PAGE_MAP, 0, VA, child.raw(), VA, cow), 0);
        assert_eq!(ks.debug_check_invariants(), 0);
    });
}
