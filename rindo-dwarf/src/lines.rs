//! ソース行情報

/// 行テーブルの1行
#[derive(Debug, Clone)]
pub struct LineRow {
    pub address: u64,
    /// LineTable内のファイル名インデックス
    pub file: usize,
    pub line: u64,
    pub is_stmt: bool,
}

/// アドレス順に並べた行番号テーブル
///
/// DWARFの行プログラムを一度だけ走査して平坦なテーブルに落とし込み、
/// 以降の検索は二分探索で行います。
pub struct LineTable {
    files: Vec<String>,
    rows: Vec<LineRow>,
}

impl LineTable {
    /// ファイル一覧と行の集合からテーブルを作る
    pub fn new(files: Vec<String>, mut rows: Vec<LineRow>) -> Self {
        rows.sort_by_key(|r| r.address);
        Self { files, rows }
    }

    /// 空のテーブル
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// ファイル一覧
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// アドレスからソース行を検索する
    ///
    /// 指定アドレス以下で最大のアドレスを持つ行が該当します。
    pub fn pc_to_line(&self, pc: u64) -> Option<(&str, u64)> {
        let idx = self.rows.partition_point(|r| r.address <= pc);
        if idx == 0 {
            return None;
        }
        let row = &self.rows[idx - 1];
        let file = self.files.get(row.file)?;
        Some((file.as_str(), row.line))
    }

    /// ファイル名と行番号からアドレスを検索する
    ///
    /// ファイル名は末尾一致でも照合します（"main.go"で"/src/main.go"に
    /// マッチする）。該当する最小のアドレスを返します。
    pub fn line_to_pc(&self, file: &str, line: u64) -> Option<u64> {
        self.rows
            .iter()
            .filter(|r| r.line == line && r.is_stmt)
            .filter(|r| {
                self.files
                    .get(r.file)
                    .map(|f| file_matches(f, file))
                    .unwrap_or(false)
            })
            .map(|r| r.address)
            .min()
    }

    /// 指定ファイルの最大の行番号
    pub fn max_line(&self, file: &str) -> Option<u64> {
        self.rows
            .iter()
            .filter(|r| {
                self.files
                    .get(r.file)
                    .map(|f| file_matches(f, file))
                    .unwrap_or(false)
            })
            .map(|r| r.line)
            .max()
    }

    /// アドレス範囲内の各ステートメント先頭アドレスを返す
    ///
    /// 同じ行が連続する場合は最初のアドレスだけを採用します。
    pub fn pcs_between(&self, lo: u64, hi: u64, file: &str) -> Vec<u64> {
        let mut pcs = Vec::new();
        let mut last_line = None;
        for row in &self.rows {
            if row.address < lo || row.address > hi {
                continue;
            }
            if !row.is_stmt {
                continue;
            }
            let matches = self
                .files
                .get(row.file)
                .map(|f| file_matches(f, file))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if last_line == Some(row.line) {
                continue;
            }
            last_line = Some(row.line);
            pcs.push(row.address);
        }
        pcs
    }
}

/// テーブル上のフルパスと問い合わせのファイル名を照合する
fn file_matches(full: &str, query: &str) -> bool {
    if full == query {
        return true;
    }
    full.ends_with(query)
        && full[..full.len() - query.len()].ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LineTable {
        LineTable::new(
            vec!["/src/main.go".to_string(), "/src/util.go".to_string()],
            vec![
                LineRow { address: 0x1000, file: 0, line: 5, is_stmt: true },
                LineRow { address: 0x1008, file: 0, line: 5, is_stmt: true },
                LineRow { address: 0x1010, file: 0, line: 6, is_stmt: true },
                LineRow { address: 0x1020, file: 0, line: 7, is_stmt: false },
                LineRow { address: 0x1030, file: 0, line: 8, is_stmt: true },
                LineRow { address: 0x2000, file: 1, line: 3, is_stmt: true },
            ],
        )
    }

    #[test]
    fn test_pc_to_line() {
        let t = table();
        assert_eq!(t.pc_to_line(0x1000), Some(("/src/main.go", 5)));
        // 行の途中のアドレスは直前の行に丸められる
        assert_eq!(t.pc_to_line(0x1015), Some(("/src/main.go", 6)));
        assert_eq!(t.pc_to_line(0xfff), None);
    }

    #[test]
    fn test_line_to_pc_suffix_match() {
        let t = table();
        assert_eq!(t.line_to_pc("main.go", 6), Some(0x1010));
        assert_eq!(t.line_to_pc("/src/main.go", 6), Some(0x1010));
        // 同一行が複数回現れる場合は最小のアドレス
        assert_eq!(t.line_to_pc("main.go", 5), Some(0x1000));
        assert_eq!(t.line_to_pc("main.go", 100), None);
        // 末尾一致はパス区切りを跨がない
        assert_eq!(t.line_to_pc("ain.go", 6), None);
    }

    #[test]
    fn test_pcs_between_dedupes_lines() {
        let t = table();
        // 行5の2つ目のアドレスと非ステートメント行は含まれない
        assert_eq!(t.pcs_between(0x1000, 0x10ff, "main.go"), vec![0x1000, 0x1010, 0x1030]);
        assert!(t.pcs_between(0x1000, 0x10ff, "util.go").is_empty());
    }

    #[test]
    fn test_max_line() {
        let t = table();
        assert_eq!(t.max_line("main.go"), Some(8));
        assert_eq!(t.max_line("nosuch.go"), None);
    }
}
