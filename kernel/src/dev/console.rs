// kernel/src/dev/console.rs
//
// 役割:
// - ユーザに見える文字入出力の抽象（Console trait）と、テスト / sim 用のバッファ実装。
//
// やること:
// - putc / getc（非ブロッキング）/ interrupt（KBD・SERIAL の IRQ で入力を取り込む）
// - core::fmt::Write へのアダプタ（cprintf 相当の書式出力）
//
// やらないこと:
// - CGA / シリアルポートのレジスタ操作

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

pub trait Console: Send {
    fn putc(&mut self, c: u8);

    /// 入力が無ければ None
    fn getc(&mut self) -> Option<u8>;

    /// KBD / SERIAL の割り込み。デバイス側に溜まった入力を取り込む。
    fn interrupt(&mut self, irq: u32) {
        let _ = irq;
    }

    fn puts(&mut self, s: &[u8]) {
        for &c in s {
            self.putc(c);
        }
    }
}

/// fmt::Write アダプタ
pub struct ConsoleWriter<'a>(pub &'a mut dyn Console);

impl fmt::Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.puts(s.as_bytes());
        Ok(())
    }
}

#[derive(Default)]
struct Buffers {
    output: Vec<u8>,
    // getc が読む（割り込みで取り込み済み）
    input: VecDeque<u8>,
    // まだデバイス側にあるもの（interrupt で input へ移る）
    pending: VecDeque<u8>,
}

/// メモリ上のコンソール。clone はバッファを共有するので、
/// カーネルに 1 つ渡し、もう 1 つをテスト側で覗く。
#[derive(Clone, Default)]
pub struct BufferConsole {
    inner: Arc<Mutex<Buffers>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// getc からすぐ読める入力を足す
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// デバイス側に入力を置く（KBD / SERIAL 割り込みが来るまで見えない）
    pub fn push_device_input(&self, bytes: &[u8]) {
        self.inner.lock().pending.extend(bytes.iter().copied());
    }

    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }

    pub fn output_string(&self) -> alloc::string::String {
        alloc::string::String::from_utf8_lossy(&self.inner.lock().output).into_owned()
    }

    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut self.inner.lock().output)
    }
}

impl Console for BufferConsole {
    fn putc(&mut self, c: u8) {
        self.inner.lock().output.push(c);
    }

    fn getc(&mut self) -> Option<u8> {
        self.inner.lock().input.pop_front()
    }

    fn interrupt(&mut self, _irq: u32) {
        let mut b = self.inner.lock();
        while let Some(c) = b.pending.pop_front() {
            b.input.push_back(c);
        }
    }
}
