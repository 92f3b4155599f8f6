// kernel/src/dev/ide.rs
//
// 役割:
// - セクタ単位のブロックデバイス抽象と、メモリ上の RamDisk。
//
// 設計方針:
// - ポート I/O の代わりに BlockDevice trait を呼ぶ。IOPL の確認は呼び出し側（machine）で行う。
// - 範囲外アクセスは Err を返す（ドライバ層で panic しない）。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::kernel::KernelError;

pub const SECTSIZE: usize = 512;

pub trait BlockDevice: Send + Sync {
    fn read_sectors(&self, secno: u32, buf: &mut [u8], nsecs: usize) -> Result<(), KernelError>;
    fn write_sectors(&self, secno: u32, buf: &[u8], nsecs: usize) -> Result<(), KernelError>;
    fn sector_count(&self) -> u32;
}

/// メモリ上のディスク。clone は中身を共有する。
#[derive(Clone)]
pub struct RamDisk {
    data: Arc<Mutex<Vec<u8>>>,
    nsecs: u32,
}

impl RamDisk {
    pub fn new(nsecs: u32) -> Self {
        RamDisk {
            data: Arc::new(Mutex::new(vec![0u8; nsecs as usize * SECTSIZE])),
            nsecs,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let nsecs = bytes.len().div_ceil(SECTSIZE) as u32;
        let disk = RamDisk::new(nsecs);
        disk.data.lock()[..bytes.len()].copy_from_slice(bytes);
        disk
    }

    /// テストで中身を直接見る
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn range(&self, secno: u32, nsecs: usize, len: usize) -> Result<(usize, usize), KernelError> {
        let bytes = nsecs * SECTSIZE;
        if len < bytes {
            return Err(KernelError::Inval);
        }
        let end = secno as u64 + nsecs as u64;
        if end > self.nsecs as u64 {
            return Err(KernelError::Inval);
        }
        let start = secno as usize * SECTSIZE;
        Ok((start, start + bytes))
    }
}

impl BlockDevice for RamDisk {
    fn read_sectors(&self, secno: u32, buf: &mut [u8], nsecs: usize) -> Result<(), KernelError> {
        let (start, end) = self.range(secno, nsecs, buf.len())?;
        buf[..end - start].copy_from_slice(&self.data.lock()[start..end]);
        Ok(())
    }

    fn write_sectors(&self, secno: u32, buf: &[u8], nsecs: usize) -> Result<(), KernelError> {
        let (start, end) = self.range(secno, nsecs, buf.len())?;
        self.data.lock()[start..end].copy_from_slice(&buf[..end - start]);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.nsecs
    }
}
