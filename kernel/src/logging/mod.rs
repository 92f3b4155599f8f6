// kernel/src/logging/mod.rs
//
// カーネル内ログの入口。
// - 呼び出し側は info / error / info_u64 / info_kv / info_hex だけを使う。
// - 出力先は log facade（target = "kernel"）。実体の Logger は
//   ホスト側（sim バイナリやテスト）が差し込む。
// - ユーザに見せる console 出力（cputs や trapframe ダンプ）はここではなく dev::console。

use core::sync::atomic::{AtomicBool, Ordering};

const TARGET: &str = "kernel";

static ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn info(msg: &str) {
    if is_enabled() {
        log::info!(target: TARGET, "{}", msg);
    }
}

pub fn error(msg: &str) {
    if is_enabled() {
        log::error!(target: TARGET, "{}", msg);
    }
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    if !is_enabled() {
        return;
    }
    if key.is_empty() {
        log::info!(target: TARGET, "{}", value);
        return;
    }
    log::info!(target: TARGET, "{} = {}", key, value);
}

/// アドレスや envid のように 16 進で見たい値
pub fn info_hex(key: &str, value: u32) {
    if is_enabled() {
        log::info!(target: TARGET, "{} = {:08x}", key, value);
    }
}
