//! Rindo デバッガ制御コア
//!
//! このクレートは、Goバイナリ向けソースレベルデバッガの中核ロジックを
//! 提供します。ブレークポイントテーブル、スレッドの実行制御、
//! ゴルーチンの列挙と選択、プロセスのライフサイクル管理を統合します。

pub mod arch;
pub mod breakpoint;
pub mod errors;
pub mod goroutine;
pub mod process;
pub mod scope;
pub mod thread;
pub mod version;

pub use arch::Arch;
pub use breakpoint::Breakpoint;
pub use errors::{DebugError, Result};
pub use goroutine::{G, GStatus};
pub use process::Process;
pub use scope::EvalScope;
pub use thread::{Location, Thread};
pub use version::GoVersion;

// 他のクレートから使用するために再エクスポート
pub use rindo_dwarf::{Frame, SymbolTable};
pub use rindo_target::{Registers, Tid, TraceOps};
