//! CPUとABIに依存する定数

use crate::version::GoVersion;

/// サポートするCPUアーキテクチャ
///
/// ポインタ幅、ブレークポイント用のトラップ命令、そしてスレッド
/// ローカルストレージ内のgポインタの位置を提供します。
#[derive(Debug, Clone, Copy)]
pub enum Arch {
    Amd64(Amd64),
}

#[derive(Debug, Clone, Copy)]
pub struct Amd64 {
    g_struct_offset: u64,
}

impl Arch {
    /// 実行ホストのアーキテクチャを選択する
    pub fn host() -> Self {
        Arch::Amd64(Amd64 { g_struct_offset: 0 })
    }

    /// ポインタのバイト数
    pub fn ptr_size(&self) -> usize {
        match self {
            Arch::Amd64(_) => 8,
        }
    }

    /// トラップ命令のバイト列（INT3）
    pub fn breakpoint_instruction(&self) -> &'static [u8] {
        match self {
            Arch::Amd64(_) => &[0xCC],
        }
    }

    /// トラップ命令の長さ
    pub fn breakpoint_size(&self) -> usize {
        self.breakpoint_instruction().len()
    }

    /// TLSベースからgポインタまでのオフセット
    pub fn g_struct_offset(&self) -> u64 {
        match self {
            Arch::Amd64(a) => a.g_struct_offset,
        }
    }

    /// ランタイムのバージョンとリンカ種別からgポインタの位置を決める
    ///
    /// linux/amd64ではTLSベースの16バイト下にgポインタが置かれるが、
    /// 外部リンカを使った場合とgo1.5以降は8バイト下になる。
    pub fn set_g_struct_offset(&mut self, ver: &GoVersion, is_extld: bool) {
        match self {
            Arch::Amd64(a) => {
                let mut offset = (-0x10i64) as u64;
                if is_extld || ver.after_or_equal(&GoVersion::new(1, 5)) {
                    offset = offset.wrapping_add(8);
                }
                a.g_struct_offset = offset;
            }
        }
    }
}
