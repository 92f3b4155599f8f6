// kernel/src/lib.rs
//
// JOS 系 exokernel のカーネル本体（hosted 実行可能）。
// - arch: Platform trait（resume / halt / EOI / CR3 / TLB）と trap 番号、hosted 実装
// - mm / mem: 物理フレーム管理、2 段ページテーブル、アドレスレイアウト
// - kernel: env、trap、syscall、IPC、COW fork、スケジューラ、monitor、big kernel lock
// - machine: ホスト上で env のユーザプログラムを step 実行するマシン
// - user: ユーザ空間ライブラリ（syscall スタブ、fork、ipc、ブロックキャッシュ）
//
// カーネルは no_std + alloc。テストと sim バイナリだけが std を使う。

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod dev;
pub mod kernel;
pub mod logging;
pub mod machine;
pub mod mem;
pub mod mm;
pub mod types;
pub mod user;

pub use config::KernelConfig;
pub use kernel::{EnvId, EnvStatus, EnvType, Kernel, KernelError, KernelState, LogEvent};
pub use machine::{Machine, UserContext, UserError, UserProgram};
pub use types::CpuId;
