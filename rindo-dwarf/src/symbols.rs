//! シンボル解決機能

use crate::{GStructLayout, LineTable};
use std::collections::HashMap;

/// 関数情報
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// エントリポイントのアドレス
    pub entry: u64,
    /// 関数末尾の次のアドレス
    pub end: u64,
}

/// バイナリから実体化したシンボルテーブル
///
/// 関数・行番号・グローバル変数・コンパイル単位のプロデューサ文字列、
/// そしてランタイムのg構造体レイアウトをまとめて保持します。
/// 構築後は読み取り専用です。
pub struct SymbolTable {
    /// エントリアドレスでソートした関数一覧
    functions: Vec<Function>,
    by_name: HashMap<String, usize>,
    /// シンボル名 -> アドレスのマップ（グローバル変数など）
    globals: HashMap<String, u64>,
    lines: LineTable,
    producers: Vec<String>,
    g_layout: Option<GStructLayout>,
}

impl SymbolTable {
    /// ELFファイルからシンボルテーブルを構築する
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> crate::Result<Self> {
        crate::DwarfLoader::load(path)?.build_table()
    }

    /// 構成要素から直接テーブルを組み立てる
    ///
    /// テストや別系統のローダーから使用します。
    pub fn from_parts(
        functions: Vec<Function>,
        lines: LineTable,
        globals: HashMap<String, u64>,
        producers: Vec<String>,
        g_layout: Option<GStructLayout>,
    ) -> Self {
        let mut functions = functions;
        functions.sort_by_key(|f| f.entry);
        let by_name = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            functions,
            by_name,
            globals,
            lines,
            producers,
            g_layout,
        }
    }

    /// アドレスを含む関数を検索する
    pub fn func_at(&self, pc: u64) -> Option<&Function> {
        let idx = self.functions.partition_point(|f| f.entry <= pc);
        if idx == 0 {
            return None;
        }
        let f = &self.functions[idx - 1];
        (pc < f.end).then_some(f)
    }

    /// 名前から関数を検索する
    pub fn lookup_func(&self, name: &str) -> Option<&Function> {
        self.by_name.get(name).map(|&i| &self.functions[i])
    }

    /// アドレスからソース行を検索する
    pub fn pc_to_line(&self, pc: u64) -> Option<(String, u64)> {
        self.lines
            .pc_to_line(pc)
            .map(|(file, line)| (file.to_string(), line))
    }

    /// ファイル名と行番号からアドレスを検索する
    pub fn line_to_pc(&self, file: &str, line: u64) -> Option<u64> {
        self.lines.line_to_pc(file, line)
    }

    /// アドレス範囲内の各ステートメント先頭アドレス
    pub fn line_pcs_between(&self, lo: u64, hi: u64, file: &str) -> Vec<u64> {
        self.lines.pcs_between(lo, hi, file)
    }

    /// 指定ファイルの最大の行番号
    pub fn max_line(&self, file: &str) -> Option<u64> {
        self.lines.max_line(file)
    }

    /// 名前付きグローバルのアドレスを検索する
    pub fn addr_for(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }

    /// 関数一覧
    pub fn funcs(&self) -> &[Function] {
        &self.functions
    }

    /// ソースファイル一覧
    pub fn sources(&self) -> &[String] {
        self.lines.files()
    }

    /// コンパイル単位のプロデューサ文字列一覧
    pub fn producers(&self) -> &[String] {
        &self.producers
    }

    /// ランタイムのg構造体レイアウト
    pub fn g_layout(&self) -> Option<&GStructLayout> {
        self.g_layout.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LineTable;

    fn table() -> SymbolTable {
        SymbolTable::from_parts(
            vec![
                Function { name: "main.main".to_string(), entry: 0x1000, end: 0x1100 },
                Function { name: "main.helper".to_string(), entry: 0x1100, end: 0x1180 },
            ],
            LineTable::empty(),
            [("runtime.allglen".to_string(), 0x2000)].into_iter().collect(),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_func_at_boundaries() {
        let t = table();
        assert_eq!(t.func_at(0x1000).map(|f| f.name.as_str()), Some("main.main"));
        assert_eq!(t.func_at(0x10ff).map(|f| f.name.as_str()), Some("main.main"));
        assert_eq!(t.func_at(0x1100).map(|f| f.name.as_str()), Some("main.helper"));
        assert!(t.func_at(0x1180).is_none());
        assert!(t.func_at(0xfff).is_none());
    }

    #[test]
    fn test_lookup() {
        let t = table();
        assert_eq!(t.lookup_func("main.helper").map(|f| f.entry), Some(0x1100));
        assert!(t.lookup_func("main.none").is_none());
        assert_eq!(t.addr_for("runtime.allglen"), Some(0x2000));
    }
}
