// kernel/src/kernel/error.rs
//
// 回復可能なエラー（syscall 境界で負のコードになる）。
// 致命的なもの（カーネル内部の不整合）はここに入れず panic する。

use core::fmt;

use crate::mem::address_space::MapError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// ユーザ側で解釈できない負の戻り値
    Unspecified,
    BadEnv,
    Inval,
    NoMem,
    NoFreeEnv,
    Fault,
    IpcNotRecv,
    /// ELF として読めない（ABI 上は Inval）
    BadElf,
}

impl KernelError {
    /// syscall の戻り値（負）
    pub fn code(self) -> i32 {
        match self {
            KernelError::Unspecified => -1,
            KernelError::BadEnv => -2,
            KernelError::Inval | KernelError::BadElf => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::Fault => -6,
            KernelError::IpcNotRecv => -7,
        }
    }

    /// ユーザ側で負の戻り値を解釈する
    pub fn from_code(code: i32) -> Option<KernelError> {
        Some(match code {
            -1 => KernelError::Unspecified,
            -2 => KernelError::BadEnv,
            -3 => KernelError::Inval,
            -4 => KernelError::NoMem,
            -5 => KernelError::NoFreeEnv,
            -6 => KernelError::Fault,
            -7 => KernelError::IpcNotRecv,
            _ => return None,
        })
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::Unspecified => "unspecified error",
            KernelError::BadEnv => "bad environment",
            KernelError::Inval => "invalid parameter",
            KernelError::NoMem => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
            KernelError::Fault => "segmentation fault",
            KernelError::IpcNotRecv => "env is not recving",
            KernelError::BadElf => "invalid ELF image",
        };
        f.write_str(s)
    }
}

impl From<MapError> for KernelError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::NoMem => KernelError::NoMem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_except_elf_which_reads_as_inval() {
        for e in [
            KernelError::Unspecified,
            KernelError::BadEnv,
            KernelError::Inval,
            KernelError::NoMem,
            KernelError::NoFreeEnv,
            KernelError::Fault,
            KernelError::IpcNotRecv,
        ] {
            assert_eq!(KernelError::from_code(e.code()), Some(e));
        }
        assert_eq!(KernelError::from_code(KernelError::BadElf.code()), Some(KernelError::Inval));
        assert_eq!(KernelError::from_code(-8), None);
    }
}
