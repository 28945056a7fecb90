//! デバッガのエラー種別

use rindo_target::Tid;
use thiserror::Error;

/// デバッガ制御の結果型
pub type Result<T> = std::result::Result<T, DebugError>;

/// デバッガ操作のエラー
///
/// NextとContinueはThreadBlocked / NoReturnAddress / NullAddress /
/// GoroutineExitingを回復可能なシグナルとして扱い、それ以外を
/// 呼び出し元へ返します。ProcessExitedは以後のすべての公開操作を
/// 短絡させます。
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("process {pid} has exited with status {status}")]
    ProcessExited { pid: Tid, status: i32 },

    #[error("breakpoint already exists at {addr:#x}")]
    BreakpointExists { addr: u64 },

    #[error("no breakpoint at {addr:#x}")]
    NoBreakpoint { addr: u64 },

    #[error("breakpoint already installed at {addr:#x}")]
    AlreadyInstalled { addr: u64 },

    #[error("no breakpoint installed at {addr:#x}")]
    NotInstalled { addr: u64 },

    #[error("thread {tid} does not exist")]
    UnknownThread { tid: Tid },

    #[error("unknown goroutine {id}")]
    UnknownGoroutine { id: i64 },

    #[error("frame {frame} does not exist in goroutine {id}")]
    FrameOutOfRange { id: i64, frame: usize },

    #[error("thread blocked")]
    ThreadBlocked,

    #[error("no return address for function {function}")]
    NoReturnAddress { function: String },

    #[error("goroutine {id} is exiting")]
    GoroutineExiting { id: i64 },

    #[error("null address")]
    NullAddress,

    #[error("could not find function {name}")]
    FunctionNotFound { name: String },

    #[error("could not read memory at {addr:#x}")]
    UnreadableMemory { addr: u64 },

    #[error("next while nexting")]
    NextWhileNexting,

    #[error("trace command failed: {0}")]
    Trace(#[from] nix::errno::Errno),

    #[error(transparent)]
    Symbols(#[from] anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
