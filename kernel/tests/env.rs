mod common;

use common::*;
use exokernel::kernel::syscall::SYS_EXOFORK;
use exokernel::mem::addr::{VirtAddr, PAGE_SIZE};
use exokernel::mem::layout::{USTACKTOP, UTEXT, UTOP};
use exokernel::mem::paging::PteFlags;
use exokernel::{CpuId, EnvId, EnvStatus, EnvType, KernelError};

#[test]
fn first_env_uses_slot_zero_with_first_generation() {
    let mut m = machine(1);
    let id = m.spawn(&image(), EnvType::User, exiting()).unwrap();

    assert_eq!(id, EnvId(0x1000));
    assert_eq!(id.index(), 0);
    assert_eq!(m.console().output_string(), "[00000000] new env 00001000\n");

    with_state(&m, |ks| {
        let e = ks.env(id).unwrap();
        assert_eq!(e.status, EnvStatus::Runnable);
        assert_eq!(e.parent_id, EnvId::NONE);
        assert_eq!(e.tf.eip, ENTRY);
        assert_eq!(e.tf.esp, USTACKTOP);
        assert!(e.tf.from_user());
    });
}

#[test]
fn recycled_slot_gets_new_generation_and_old_id_goes_stale() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let a = ks.env_create(&img, EnvType::User).unwrap();
        ks.env_destroy(a.index());
        assert!(ks.env(a).is_none());

        let b = ks.env_create(&img, EnvType::User).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b, a);
        assert_eq!(b, EnvId(0x2000));

        assert_eq!(ks.envid2env(a, false), Err(KernelError::BadEnv));
        assert_eq!(ks.envid2env(b, false), Ok(b.index()));
    });
}

#[test]
fn envid_zero_means_curenv() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        // curenv が無ければ BadEnv
        assert_eq!(ks.envid2env(EnvId::NONE, false), Err(KernelError::BadEnv));

        let a = ks.env_create(&img, EnvType::User).unwrap();
        ks.env_run(a.index());
        assert_eq!(ks.envid2env(EnvId::NONE, true), Ok(a.index()));
    });
}

#[test]
fn checkperm_allows_only_self_and_direct_children() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let a = ks.env_create(&img, EnvType::User).unwrap();
        let b = ks.env_create(&img, EnvType::User).unwrap();
        ks.env_run(a.index());

        assert_eq!(ks.envid2env(b, true), Err(KernelError::BadEnv));
        assert_eq!(ks.envid2env(b, false), Ok(b.index()));

        let child = EnvId(ks.syscall(SYS_EXOFORK, 0, 0, 0, 0, 0));
        assert!(child.0 > 0);
        assert_eq!(ks.env(child).unwrap().parent_id, a);
        assert_eq!(ks.env(child).unwrap().status, EnvStatus::NotRunnable);
        assert_eq!(ks.envid2env(child, true), Ok(child.index()));
    });
}

#[test]
fn load_program_copies_data_and_zeroes_bss() {
    let mut m = machine(1);
    m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();

    let r = m.with_env_context(CpuId(0), |ctx| {
        let mut data = [0u8; 5];
        ctx.load_bytes(VirtAddr(DATA_VA), &mut data).unwrap();
        let text = ctx.load_u8(VirtAddr(UTEXT + 10)).unwrap();
        let bss_first = ctx.load_u8(VirtAddr(DATA_VA + 5)).unwrap();
        let bss_last = ctx.load_u8(VirtAddr(DATA_VA + 2 * PAGE_SIZE - 1)).unwrap();
        let live = ctx.live_context().unwrap();
        (data, text, bss_first, bss_last, live.eip, live.esp)
    });

    let (data, text, bss_first, bss_last, eip, esp) = r.unwrap();
    assert_eq!(&data, DATA);
    assert_eq!(text, 0x90);
    assert_eq!(bss_first, 0);
    assert_eq!(bss_last, 0);
    assert_eq!(eip, ENTRY);
    assert_eq!(esp, USTACKTOP);
}

#[test]
fn user_stack_page_is_mapped_writable() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let a = ks.env_create(&img, EnvType::User).unwrap();
        let flags = pte_flags(ks, a, USTACKTOP - PAGE_SIZE).unwrap();
        assert!(flags.contains(URW));
        assert!(pte_flags(ks, a, USTACKTOP).is_none());
    });
}

#[test]
fn bad_elf_is_rejected_without_leaking() {
    let m = machine(1);
    with_state(&m, |ks| {
        let before = ks.pmm().free_frames();
        assert_eq!(
            ks.env_create(b"definitely not an ELF image", EnvType::User),
            Err(KernelError::BadElf)
        );
        assert_eq!(ks.pmm().free_frames(), before);

        // 失敗した slot は free list に戻っている
        let id = ks.env_create(&image(), EnvType::User).unwrap();
        assert_eq!(id.index(), 0);
    });
}

// data セグメント（2 番目の program header）の値を書き換えた image
fn image_with_data_phdr(field: usize, value: u32) -> Vec<u8> {
    let mut img = image();
    let at = 52 + 32 + field;
    img[at..at + 4].copy_from_slice(&value.to_le_bytes());
    img
}

#[test]
#[should_panic(expected = "segment 1 va 0x00801000 filesz 0x5 > memsz 0x1")]
fn segment_with_filesz_over_memsz_is_named_in_the_panic() {
    let img = image_with_data_phdr(20, 1);
    let m = machine(1);
    with_state(&m, |ks| {
        let _ = ks.env_create(&img, EnvType::User);
    });
}

#[test]
#[should_panic(expected = "segment 1 va 0x00801000 offset 0xffff0000 filesz 0x5 exceeds image")]
fn segment_past_the_end_of_the_image_is_named_in_the_panic() {
    let img = image_with_data_phdr(4, 0xffff_0000);
    let m = machine(1);
    with_state(&m, |ks| {
        let _ = ks.env_create(&img, EnvType::User);
    });
}

#[test]
fn bad_elf_reports_inval_at_the_syscall_boundary() {
    assert_eq!(KernelError::BadElf.code(), KernelError::Inval.code());
}

#[test]
fn fs_env_runs_with_iopl_3() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let fs = ks.env_create(&img, EnvType::Fs).unwrap();
        let user = ks.env_create(&img, EnvType::User).unwrap();
        assert_eq!(ks.env(fs).unwrap().tf.iopl(), 3);
        assert_eq!(ks.env(user).unwrap().tf.iopl(), 0);
    });
}

#[test]
fn region_alloc_covers_unaligned_ranges_and_rejects_utop() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let a = ks.env_create(&img, EnvType::User).unwrap();
        let base = 0x0040_0000;

        ks.region_alloc(a.index(), VirtAddr(base + PAGE_SIZE - 2), 4).unwrap();
        assert!(pte_flags(ks, a, base).is_some());
        assert!(pte_flags(ks, a, base + PAGE_SIZE).is_some());
        assert!(pte_flags(ks, a, base + 2 * PAGE_SIZE).is_none());

        // 既にあるページはそのまま
        let f = frame_of(ks, a, base).unwrap();
        ks.region_alloc(a.index(), VirtAddr(base), PAGE_SIZE).unwrap();
        assert_eq!(frame_of(ks, a, base), Some(f));

        assert_eq!(
            ks.region_alloc(a.index(), VirtAddr(UTOP - PAGE_SIZE), 2 * PAGE_SIZE),
            Err(KernelError::Inval)
        );
    });
}

#[test]
fn env_free_returns_every_frame() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let before = ks.pmm().free_frames();
        let a = ks.env_create(&img, EnvType::User).unwrap();
        assert!(ks.pmm().free_frames() < before);

        ks.env_destroy(a.index());
        assert_eq!(ks.pmm().free_frames(), before);
        assert_eq!(ks.counters.envs_freed, 1);
        assert_eq!(ks.debug_check_invariants(), 0);
    });
}

#[test]
fn env_pages_never_carry_unexpected_flags() {
    let m = machine(1);
    let img = image();
    with_state(&m, |ks| {
        let a = ks.env_create(&img, EnvType::User).unwrap();
        let space = ks.env(a).unwrap().pgdir.unwrap();
        let mut n = 0;
        space.for_each_mapping(ks.pmm(), VirtAddr(UTOP), |_, pte| {
            assert!(pte.flags().contains(PteFlags::USER | PteFlags::PRESENT));
            assert!(!pte.flags().contains(PteFlags::COW));
            n += 1;
        });
        // text + data 2 page + stack
        assert_eq!(n, 4);
    });
}

#[test]
fn destroying_a_dying_env_again_waits_for_its_cpu() {
    let mut m = machine(2);
    let a = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    let b = m.spawn(&image(), EnvType::User, spinning()).unwrap();
    m.start();
    assert_eq!(m.kernel().current_env(CpuId(1)), Some(b));

    with_state(&m, |ks| {
        ks.env_destroy(b.index());
        ks.env_destroy(b.index());
        // まだ CPU 1 の上にいるので回収されない
        assert_eq!(ks.env(b).unwrap().status, EnvStatus::Dying);
        assert_eq!(ks.curenv_on(CpuId(1)), Some(b));
        assert_eq!(ks.debug_check_invariants(), 0);

        // スロットは空いていないので、新しい env は別の index に入る
        let c = ks.env_create(&image(), EnvType::User).unwrap();
        assert_ne!(c.index(), b.index());
    });
    assert_eq!(m.kernel().current_env(CpuId(0)), Some(a));

    m.timer_interrupt(CpuId(1));
    assert!(!m.kernel().env_alive(b));
    with_state(&m, |ks| assert_eq!(ks.debug_check_invariants(), 0));
}
