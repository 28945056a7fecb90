//! トレース対象のランタイム変数の読み取り

use crate::{MemoryReader, Result, SymbolTable};

/// 文字列長の上限（壊れたヘッダを読んだときの暴走防止）
const MAX_STRING_LEN: u64 = 4096;

/// 名前付きパッケージ変数をGo文字列として読み取る
///
/// Goの文字列はポインタと長さの16バイトのヘッダで表現されます。
/// ランタイムのバージョン文字列（runtime.buildVersion）の取得に使用します。
pub fn read_package_string(
    table: &SymbolTable,
    mem: &dyn MemoryReader,
    name: &str,
) -> Result<String> {
    let addr = table
        .addr_for(name)
        .ok_or_else(|| anyhow::anyhow!("symbol {} not found", name))?;

    let ptr = mem.read_u64(addr)?;
    let len = mem.read_u64(addr + 8)?;

    if ptr == 0 {
        anyhow::bail!("null string pointer for {}", name);
    }
    if len > MAX_STRING_LEN {
        anyhow::bail!("implausible string length {} for {}", len, name);
    }

    let bytes = mem.read(ptr, len as usize)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::LineTable;
    use std::collections::HashMap;

    struct MapMem(HashMap<u64, u8>);

    impl MemoryReader for MapMem {
        fn read(&self, addr: u64, len: usize) -> crate::Result<Vec<u8>> {
            Ok((0..len)
                .map(|i| self.0.get(&(addr + i as u64)).copied().unwrap_or(0))
                .collect())
        }
    }

    fn table_with(name: &str, addr: u64) -> SymbolTable {
        SymbolTable::from_parts(
            Vec::new(),
            LineTable::empty(),
            [(name.to_string(), addr)].into_iter().collect(),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_read_package_string() {
        let table = table_with("runtime.buildVersion", 0x2000);
        let mut mem = MapMem(HashMap::new());
        for (i, b) in 0x3000u64.to_le_bytes().iter().enumerate() {
            mem.0.insert(0x2000 + i as u64, *b);
        }
        for (i, b) in 5u64.to_le_bytes().iter().enumerate() {
            mem.0.insert(0x2008 + i as u64, *b);
        }
        for (i, b) in b"go1.5".iter().enumerate() {
            mem.0.insert(0x3000 + i as u64, *b);
        }

        let s = read_package_string(&table, &mem, "runtime.buildVersion").expect("read");
        assert_eq!(s, "go1.5");
    }

    #[test]
    fn test_read_package_string_null_pointer() {
        let table = table_with("runtime.buildVersion", 0x2000);
        let mem = MapMem(HashMap::new());
        assert!(read_package_string(&table, &mem, "runtime.buildVersion").is_err());
    }

    #[test]
    fn test_read_package_string_missing_symbol() {
        let table = table_with("runtime.buildVersion", 0x2000);
        let mem = MapMem(HashMap::new());
        assert!(read_package_string(&table, &mem, "runtime.other").is_err());
    }
}
