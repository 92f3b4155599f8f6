// kernel/src/arch/mod.rs
//
// アーキ依存部。ハードウェアに触る操作はすべて Platform trait の向こう側に閉じ込める。
// - trapframe: 保存コンテキストとユーザ例外フレーム
// - interrupts: trap 番号 / IRQ / ゲート DPL
// - hosted: テストと sim バイナリで使うソフトウェア実装
//
// カーネル本体は「resume(context) で戻る」「halt で止まる」しか知らない。

pub mod hosted;
pub mod interrupts;
pub mod trapframe;

use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::types::CpuId;
use trapframe::Trapframe;

/// CPU / 割り込みコントローラ / MMU 制御の最小インタフェース
pub trait Platform: Send + Sync {
    /// 保存コンテキストでユーザモードへ戻る（iret 相当）
    fn resume(&self, cpu: CpuId, tf: &Trapframe);

    /// 次の割り込みまで CPU を止める（sti; hlt 相当）
    fn halt(&self, cpu: CpuId);

    /// local APIC へ EOI を送る
    fn lapic_eoi(&self, cpu: CpuId);

    /// ページディレクトリを切り替える
    fn lcr3(&self, cpu: CpuId, root: PhysAddr);

    /// 1 エントリ分の TLB を無効化する
    fn invlpg(&self, cpu: CpuId, va: VirtAddr);

    /// 直前のページフォルトのアドレス
    fn rcr2(&self, cpu: CpuId) -> u32;
}
