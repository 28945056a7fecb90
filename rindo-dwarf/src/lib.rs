//! Rindo DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! 関数・行番号・グローバルシンボルのテーブル化、ランタイムのg構造体の
//! レイアウト抽出、フレームポインタによるスタック巻き戻しなどを行います。

pub mod eval;
pub mod gstruct;
pub mod lines;
pub mod loader;
pub mod stack;
pub mod symbols;

pub use gstruct::GStructLayout;
pub use lines::{LineRow, LineTable};
pub use loader::DwarfLoader;
pub use stack::{Frame, FrameUnwinder};
pub use symbols::{Function, SymbolTable};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;

/// トレース対象のメモリから読み取り可能なもの
///
/// デバッガ側のスレッドやテスト用のフェイクがこれを実装します。
pub trait MemoryReader {
    /// 指定番地からバイト列を読み取る
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// u64値を読み取る（リトルエンディアン）
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("short read at {:#x}", addr))?;
        Ok(u64::from_le_bytes(array))
    }

    /// u32値を読み取る（リトルエンディアン）
    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.read(addr, 4)?;
        let array: [u8; 4] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("short read at {:#x}", addr))?;
        Ok(u32::from_le_bytes(array))
    }

    /// u8値を読み取る
    fn read_u8(&self, addr: u64) -> Result<u8> {
        let bytes = self.read(addr, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("short read at {:#x}", addr))
    }
}
