//! OSスレッドの実行制御

use crate::arch::Arch;
use crate::breakpoint::Breakpoint;
use crate::errors::{DebugError, Result};
use crate::goroutine::{parse_g, G};
use nix::sys::wait::WaitStatus;
use rindo_dwarf::{MemoryReader, SymbolTable};
use rindo_target::{Registers, Serializer, Tid};
use std::collections::HashMap;
use std::sync::Arc;

/// ステップ不能なブロッキング呼び出しとして扱うランタイム関数
const BLOCKED_FUNCTIONS: &[&str] = &["runtime.futex", "runtime.usleep", "runtime.clone"];

/// ソースコード上の位置
#[derive(Debug, Clone)]
pub struct Location {
    pub pc: u64,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub function: Option<String>,
}

/// PCからソース位置を組み立てる
pub(crate) fn locate(symbols: &SymbolTable, pc: u64) -> Location {
    let (file, line) = match symbols.pc_to_line(pc) {
        Some((f, l)) => (Some(f), Some(l)),
        None => (None, None),
    };
    let function = symbols.func_at(pc).map(|f| f.name.clone());
    Location {
        pc,
        file,
        line,
        function,
    }
}

/// トレース対象のOSスレッド
///
/// メモリとレジスタへのアクセスはすべてシリアライザ経由で行います。
/// current_breakpointは「このスレッドがこのブレークポイントで停止し、
/// まだ元の命令を実行していない」ことを示すラッチです。
pub struct Thread {
    pub id: Tid,
    /// 直近のwaitステータス
    pub status: Option<WaitStatus>,
    /// ブレークポイント停止のラッチ（次のステップで解消される）
    pub current_breakpoint: Option<Breakpoint>,
    pub breakpoint_condition_met: bool,
    pub(crate) running: bool,
    pid: Tid,
    serializer: Arc<Serializer>,
}

impl Thread {
    pub(crate) fn new(id: Tid, pid: Tid, serializer: Arc<Serializer>) -> Self {
        Self {
            id,
            status: None,
            current_breakpoint: None,
            breakpoint_condition_met: false,
            running: false,
            pid,
            serializer,
        }
    }

    /// スレッドが実行中とみなされているか
    pub fn running(&self) -> bool {
        self.running
    }

    /// シリアライザ上でトレース操作を実行する
    fn exec<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn rindo_target::TraceOps) -> T + Send + 'static,
    {
        self.serializer.exec(f).map_err(|closed| DebugError::ProcessExited {
            pid: self.pid,
            status: closed.status,
        })
    }

    /// トレース対象のメモリを読み取る
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let pid = self.pid;
        self.exec(move |ops| ops.peek_memory(pid, addr, len))?
            .map_err(|_| DebugError::UnreadableMemory { addr })
    }

    /// トレース対象のメモリへ書き込む
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let pid = self.pid;
        let data = data.to_vec();
        self.exec(move |ops| ops.poke_memory(pid, addr, &data))??;
        Ok(())
    }

    /// レジスタを読み取る
    pub fn registers(&self) -> Result<Registers> {
        let tid = self.id;
        Ok(self.exec(move |ops| ops.get_regs(tid))??)
    }

    /// レジスタを書き込む
    pub fn set_registers(&self, regs: Registers) -> Result<()> {
        let tid = self.id;
        self.exec(move |ops| ops.set_regs(tid, regs))??;
        Ok(())
    }

    /// プログラムカウンタを取得する
    pub fn pc(&self) -> Result<u64> {
        Ok(self.registers()?.pc())
    }

    /// プログラムカウンタを設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.registers()?;
        regs.set_pc(pc);
        self.set_registers(regs)
    }

    /// 現在位置のソース情報を取得する
    pub fn location(&self, symbols: &SymbolTable) -> Result<Location> {
        Ok(locate(symbols, self.pc()?))
    }

    /// ステップ不能なランタイム呼び出しの中で停止しているか
    pub fn blocked(&self, symbols: &SymbolTable) -> bool {
        let Ok(pc) = self.pc() else {
            return false;
        };
        symbols
            .func_at(pc)
            .map(|f| BLOCKED_FUNCTIONS.contains(&f.name.as_str()))
            .unwrap_or(false)
    }

    /// 1命令だけ実行する
    ///
    /// ブレークポイント上にいる場合は一時的にトラップを外し、元の命令を
    /// 実行してからトラップを書き戻します。ブロッキング呼び出しの中に
    /// いる場合はThreadBlockedで何もしません。
    pub fn step(
        &mut self,
        breakpoints: &HashMap<u64, Breakpoint>,
        arch: &Arch,
        symbols: &SymbolTable,
    ) -> Result<()> {
        if self.blocked(symbols) {
            return Err(DebugError::ThreadBlocked);
        }

        let pc = self.pc()?;
        let bp = self
            .current_breakpoint
            .clone()
            .filter(|b| b.addr == pc)
            .or_else(|| breakpoints.get(&pc).cloned());

        match bp {
            Some(bp) => {
                self.write_memory(bp.addr, &bp.original)?;
                let stepped = self.single_step();
                let restored = bp.reinstall(self, arch);
                stepped.and(restored)
            }
            None => self.single_step(),
        }
    }

    /// OSのシングルステップを発行して停止を待つ
    fn single_step(&mut self) -> Result<()> {
        let tid = self.id;
        let status = self.exec(move |ops| -> rindo_target::Result<WaitStatus> {
            ops.single_step(tid)?;
            ops.wait(tid)
        })??;
        if let WaitStatus::Exited(_, code) = status {
            return Err(DebugError::ProcessExited {
                pid: self.pid,
                status: code,
            });
        }
        self.status = Some(status);
        Ok(())
    }

    /// 実行を再開する（停止は待たない）
    ///
    /// ラッチ済みのブレークポイントはここで解消されます。
    pub fn resume(&mut self) -> Result<()> {
        self.current_breakpoint = None;
        self.running = true;
        let tid = self.id;
        self.exec(move |ops| ops.cont(tid, None))??;
        Ok(())
    }

    /// 停止シグナルを送り、停止イベントを待つ
    pub fn halt(&mut self) -> Result<()> {
        let (pid, tid) = (self.pid, self.id);
        let stopped = self.exec(move |ops| ops.is_stopped(pid, tid))?;
        if stopped {
            self.running = false;
            return Ok(());
        }
        let status = self.exec(move |ops| -> rindo_target::Result<WaitStatus> {
            ops.stop_thread(pid, tid)?;
            ops.wait(tid)
        })??;
        if let WaitStatus::Exited(_, code) = status {
            return Err(DebugError::ProcessExited { pid, status: code });
        }
        self.status = Some(status);
        self.running = false;
        Ok(())
    }

    /// トラップ直後のPCからヒットしたブレークポイントを特定する
    ///
    /// PC - トラップ長の位置にテーブルのエントリがあればラッチし、
    /// 次の実行で元の命令が動くようPCを巻き戻します。
    pub(crate) fn set_current_breakpoint(
        &mut self,
        breakpoints: &HashMap<u64, Breakpoint>,
        arch: &Arch,
    ) -> Result<()> {
        self.current_breakpoint = None;
        let pc = self.pc()?;
        let addr = pc.wrapping_sub(arch.breakpoint_size() as u64);
        if let Some(bp) = breakpoints.get(&addr) {
            self.current_breakpoint = Some(bp.clone());
            self.set_pc(bp.addr)?;
        }
        Ok(())
    }

    /// 条件の成立したブレークポイントで停止しているか
    pub fn on_triggered_breakpoint(&self) -> bool {
        self.current_breakpoint.is_some() && self.breakpoint_condition_met
    }

    /// 条件の成立した一時ブレークポイントで停止しているか
    pub fn on_triggered_temp_breakpoint(&self) -> bool {
        self.on_triggered_breakpoint()
            && self
                .current_breakpoint
                .as_ref()
                .map(|bp| bp.temp)
                .unwrap_or(false)
    }

    /// このスレッドが現在実行しているゴルーチンを読み取る
    ///
    /// TLSベースにアーキテクチャ固有のオフセットを足した位置から
    /// gポインタを取り出し、記述子を解析します。
    pub fn get_g(&self, arch: &Arch, symbols: &SymbolTable) -> Result<G> {
        let layout = symbols.g_layout().ok_or_else(|| {
            DebugError::Symbols(anyhow::anyhow!("runtime.g layout not present in debug info"))
        })?;
        let regs = self.registers()?;
        let slot = regs.tls().wrapping_add(arch.g_struct_offset());
        let gaddr = self
            .read_memory(slot, 8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap_or([0; 8])))?;
        parse_g(self, gaddr, false, layout, symbols)
    }
}

impl MemoryReader for Thread {
    fn read(&self, addr: u64, len: usize) -> rindo_dwarf::Result<Vec<u8>> {
        self.read_memory(addr, len).map_err(anyhow::Error::new)
    }
}
