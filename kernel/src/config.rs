// kernel/src/config.rs
//
// 役割:
// - 起動時に決める可変パラメータ（物理メモリ量、CPU 数、カーネルイメージの大きさ）をまとめる。
// やらないこと:
// - アドレスレイアウトや NENV などのコンパイル時定数（mem::layout / kernel::env 側）。
// - trace の ON/OFF（Cargo feature 側）。

use crate::types::MemoryMap;

/// サポートする CPU の最大数
pub const MAX_CPUS: usize = 8;

#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// 物理メモリ量（バイト）
    pub phys_memory_bytes: u32,
    /// 起動する CPU の数（1..=MAX_CPUS）
    pub ncpu: usize,
    /// EXTPHYSMEM から置かれるカーネルイメージの大きさ
    pub kernel_image_bytes: u32,
    /// console 出力を logging にも流すか
    pub console_echo: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            phys_memory_bytes: 32 * 1024 * 1024,
            ncpu: 1,
            kernel_image_bytes: 1024 * 1024,
            console_echo: false,
        }
    }
}

impl KernelConfig {
    pub fn with_memory(mut self, bytes: u32) -> Self {
        self.phys_memory_bytes = bytes;
        self
    }

    pub fn with_cpus(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu.clamp(1, MAX_CPUS);
        self
    }

    pub fn with_kernel_image(mut self, bytes: u32) -> Self {
        self.kernel_image_bytes = bytes;
        self
    }

    pub fn with_console_echo(mut self, echo: bool) -> Self {
        self.console_echo = echo;
        self
    }

    pub fn memory_map(&self) -> MemoryMap {
        MemoryMap::pc_layout(self.phys_memory_bytes)
    }
}
