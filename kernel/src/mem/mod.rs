// kernel/src/mem/mod.rs
//
// 仮想メモリの型と操作。
// - addr: 32bit アドレス / フレーム / ページ番号
// - paging: PTE と権限ビット（COW / SHARE などソフトウェアビットを含む）
// - address_space: env ごとの 2 段ページテーブル（insert / lookup / remove / walk）
// - layout: UTOP / UXSTACKTOP / KERNBASE など仮想アドレス空間の配置
//
// 物理フレームの割り当てと参照カウントは mm 側が持つ。

pub mod addr;
pub mod address_space;
pub mod layout;
pub mod paging;
