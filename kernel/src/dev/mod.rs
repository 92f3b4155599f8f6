// kernel/src/dev/mod.rs
//
// カーネルの外側にあるデバイスとの細いインタフェース。
// - console: cputs / cgetc / trapframe ダンプの出力先、KBD/SERIAL 割り込みの受け口
// - ide: セクタ単位の読み書き（ブロックキャッシュが使う）
//
// レジスタレベルのドライバはここには置かない。

pub mod console;
pub mod ide;
