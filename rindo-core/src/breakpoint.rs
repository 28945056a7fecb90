//! ブレークポイント機能

use crate::arch::Arch;
use crate::errors::{DebugError, Result};
use crate::thread::Thread;
use rindo_dwarf::SymbolTable;

/// パッチ済みの1箇所のブレークポイント
///
/// 設置時にトラップ命令で上書きした元のバイト列を保持し、
/// 解除時に復元します。tempは内部用の一時ブレークポイントで、
/// ユーザの一覧には現れず、次のユーザ可視の停止までに必ず
/// 片付けられます。
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub addr: u64,
    /// トラップで上書きする前の命令バイト列
    pub original: Vec<u8>,
    pub id: usize,
    pub temp: bool,
    /// 発火条件となるゴルーチンID
    pub cond: Option<i64>,
}

impl Breakpoint {
    pub(crate) fn new(id: usize, addr: u64, temp: bool) -> Self {
        Self {
            addr,
            original: Vec::new(),
            id,
            temp,
            cond: None,
        }
    }

    /// トラップ命令を書き込んでブレークポイントを設置する
    ///
    /// 既にトラップ命令が書かれている場合はAlreadyInstalledで失敗します。
    pub(crate) fn install(&mut self, thread: &Thread, arch: &Arch) -> Result<()> {
        let data = thread.read_memory(self.addr, arch.breakpoint_size())?;
        if data == arch.breakpoint_instruction() {
            return Err(DebugError::AlreadyInstalled { addr: self.addr });
        }
        self.original = data;
        thread.write_memory(self.addr, arch.breakpoint_instruction())
    }

    /// 元の命令を復元してブレークポイントを解除する
    pub(crate) fn clear(&self, thread: &Thread, arch: &Arch) -> Result<()> {
        let data = thread.read_memory(self.addr, arch.breakpoint_size())?;
        if data != arch.breakpoint_instruction() {
            return Err(DebugError::NotInstalled { addr: self.addr });
        }
        thread.write_memory(self.addr, &self.original)
    }

    /// ステップ通過後にトラップ命令を書き戻す
    pub(crate) fn reinstall(&self, thread: &Thread, arch: &Arch) -> Result<()> {
        thread.write_memory(self.addr, arch.breakpoint_instruction())
    }

    /// 条件を評価する
    ///
    /// 条件が無ければ常に成立。条件付きの場合、ヒットしたスレッドが
    /// 現在実行しているゴルーチンのIDと一致したときだけ成立します。
    pub(crate) fn check_condition(
        &self,
        thread: &Thread,
        arch: &Arch,
        symbols: &SymbolTable,
    ) -> bool {
        let Some(cond) = self.cond else {
            return true;
        };
        match thread.get_g(arch, symbols) {
            Ok(g) => g.id == cond,
            Err(_) => false,
        }
    }
}
