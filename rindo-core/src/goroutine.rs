//! ゴルーチンのスナップショット

use crate::errors::{DebugError, Result};
use crate::thread::{locate, Location};
use rindo_dwarf::{GStructLayout, MemoryReader, SymbolTable};
use rindo_target::Tid;

/// チャネル受信待ちを表すwaitreason
const CHAN_RECEIVE: &str = "chan receive";

/// waitreason文字列の長さ上限
const MAX_WAIT_REASON: u64 = 64;

/// ランタイム内部のゴルーチン状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GStatus {
    Idle,
    Runnable,
    Running,
    Syscall,
    Waiting,
    MoribundUnused,
    Dead,
    Enqueue,
    Copystack,
    Unknown(u32),
}

impl GStatus {
    pub fn from_raw(v: u32) -> GStatus {
        match v {
            0 => GStatus::Idle,
            1 => GStatus::Runnable,
            2 => GStatus::Running,
            3 => GStatus::Syscall,
            4 => GStatus::Waiting,
            5 => GStatus::MoribundUnused,
            6 => GStatus::Dead,
            7 => GStatus::Enqueue,
            8 => GStatus::Copystack,
            other => GStatus::Unknown(other),
        }
    }
}

/// トレース対象のメモリから読み取ったゴルーチンのスナップショット
///
/// 列挙キャッシュの中だけで生きる不変の値です。threadには
/// このゴルーチンを実行中のOSスレッドのIDが入ります（いなければNone）。
#[derive(Debug, Clone)]
pub struct G {
    pub id: i64,
    pub status: GStatus,
    pub wait_reason: String,
    /// スケジューラに保存された再開時のスタックポインタ
    pub sp: u64,
    /// スケジューラに保存された再開時のPC
    pub pc: u64,
    /// 保存されたベースポインタ（古いランタイムでは0）
    pub bp: u64,
    pub current_loc: Location,
    pub thread: Option<Tid>,
}

impl G {
    /// チャネル受信でブロックされているか
    ///
    /// スレッドに載っていて動いているゴルーチンは対象外です。
    pub fn chan_recv_blocked(&self) -> bool {
        self.thread.is_none() && self.wait_reason == CHAN_RECEIVE
    }
}

/// 指定アドレスのゴルーチン記述子を解析する
///
/// derefが真の場合、addrには記述子へのポインタが格納されているものとして
/// 一段デリファレンスします。ポインタが0ならNullAddressになります。
pub(crate) fn parse_g(
    mem: &dyn MemoryReader,
    addr: u64,
    deref: bool,
    layout: &GStructLayout,
    symbols: &SymbolTable,
) -> Result<G> {
    let gaddr = if deref { read_u64(mem, addr)? } else { addr };
    if gaddr == 0 {
        return Err(DebugError::NullAddress);
    }

    let id = read_u64(mem, gaddr + layout.goid)? as i64;
    let status = GStatus::from_raw(read_u32(mem, gaddr + layout.status)?);
    let wait_reason = read_go_string(mem, gaddr + layout.waitreason);

    let sched = gaddr + layout.sched;
    let sp = read_u64(mem, sched + layout.sched_sp)?;
    let pc = read_u64(mem, sched + layout.sched_pc)?;
    let bp = match layout.sched_bp {
        Some(off) => read_u64(mem, sched + off).unwrap_or(0),
        None => 0,
    };

    Ok(G {
        id,
        status,
        wait_reason,
        sp,
        pc,
        bp,
        current_loc: locate(symbols, pc),
        thread: None,
    })
}

fn read_u64(mem: &dyn MemoryReader, addr: u64) -> Result<u64> {
    mem.read_u64(addr)
        .map_err(|_| DebugError::UnreadableMemory { addr })
}

fn read_u32(mem: &dyn MemoryReader, addr: u64) -> Result<u32> {
    mem.read_u32(addr)
        .map_err(|_| DebugError::UnreadableMemory { addr })
}

/// Go文字列（ポインタ+長さ）を読み取る
///
/// 読めない場合や長すぎる場合は空文字列として扱います。
fn read_go_string(mem: &dyn MemoryReader, addr: u64) -> String {
    let Ok(ptr) = mem.read_u64(addr) else {
        return String::new();
    };
    let Ok(len) = mem.read_u64(addr + 8) else {
        return String::new();
    };
    if ptr == 0 || len == 0 || len > MAX_WAIT_REASON {
        return String::new();
    }
    match mem.read(ptr, len as usize) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}
