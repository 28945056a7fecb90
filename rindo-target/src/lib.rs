//! Rindo ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptraceシステムコールのゲートウェイ、トレース要求の直列化、レジスタアクセスなどを行います。

pub mod ptrace;
pub mod registers;
pub mod serializer;
pub mod testing;

pub use ptrace::{PtraceOps, TraceOps};
pub use registers::Registers;
pub use serializer::{Serializer, SerializerClosed};

/// OSスレッドID
pub type Tid = i32;

/// トレースシステムコールの結果型
pub type Result<T> = std::result::Result<T, nix::errno::Errno>;
