//! 評価用スコープ

use rindo_target::Tid;

/// 変数評価の対象となるスタックフレームの束縛
///
/// スレッド・PC・正規フレームアドレスの3つ組で、評価器への入力になります。
#[derive(Debug, Clone, Copy)]
pub struct EvalScope {
    pub thread: Tid,
    pub pc: u64,
    pub cfa: i64,
}
