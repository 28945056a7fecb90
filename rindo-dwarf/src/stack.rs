//! フレームポインタによるスタック巻き戻し

use crate::{MemoryReader, Result, SymbolTable};

/// 無限ループ防止のためのフレーム数上限
const MAX_FRAMES: usize = 100;

/// スタックフレーム情報
#[derive(Debug, Clone)]
pub struct Frame {
    /// フレームのPC（フレーム0以外はリターンアドレス）
    pub pc: u64,
    /// 正規フレームアドレス
    pub cfa: i64,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub function: Option<String>,
}

/// フレームポインタのチェーンを辿る巻き戻し器
///
/// RBPが指す位置に前のRBP、その8バイト上にリターンアドレスが
/// 保存されている前提で呼び出しスタックを辿ります。
pub struct FrameUnwinder<'a> {
    table: &'a SymbolTable,
}

impl<'a> FrameUnwinder<'a> {
    pub fn new(table: &'a SymbolTable) -> Self {
        Self { table }
    }

    /// 指定のレジスタ状態からスタックを巻き戻す
    ///
    /// 最大で`depth + 1`個のフレーム（現在位置と呼び出し元depth段）を返します。
    pub fn unwind(
        &self,
        mem: &dyn MemoryReader,
        pc: u64,
        _sp: u64,
        bp: u64,
        depth: usize,
    ) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        frames.push(self.frame_at(pc, cfa_for(bp)));

        let mut bp = bp;
        while frames.len() < depth + 1 && frames.len() < MAX_FRAMES {
            // RBPが無効になったらスタックの終端
            if bp == 0 || bp < 0x1000 {
                break;
            }
            let Ok(prev_bp) = mem.read_u64(bp) else {
                break;
            };
            let Ok(return_address) = mem.read_u64(bp + 8) else {
                break;
            };
            if return_address == 0 || return_address < 0x1000 {
                break;
            }

            frames.push(self.frame_at(return_address, cfa_for(prev_bp)));

            // スタックは下方向に伸びるため、前のRBPは必ず大きくなる
            if prev_bp <= bp {
                break;
            }
            bp = prev_bp;
        }

        Ok(frames)
    }

    fn frame_at(&self, pc: u64, cfa: i64) -> Frame {
        let (file, line) = match self.table.pc_to_line(pc) {
            Some((f, l)) => (Some(f), Some(l)),
            None => (None, None),
        };
        let function = self.table.func_at(pc).map(|f| f.name.clone());
        Frame {
            pc,
            cfa,
            file,
            line,
            function,
        }
    }
}

/// ベースポインタからCFAを求める
///
/// 保存済みRBPとリターンアドレスの直上が呼び出し規約上のCFAになります。
fn cfa_for(bp: u64) -> i64 {
    bp.wrapping_add(16) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::LineTable;
    use crate::symbols::Function;
    use std::collections::HashMap;

    struct MapMem(HashMap<u64, u8>);

    impl MapMem {
        fn new() -> Self {
            Self(HashMap::new())
        }

        fn put_u64(&mut self, addr: u64, value: u64) {
            for (i, b) in value.to_le_bytes().iter().enumerate() {
                self.0.insert(addr + i as u64, *b);
            }
        }
    }

    impl MemoryReader for MapMem {
        fn read(&self, addr: u64, len: usize) -> crate::Result<Vec<u8>> {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                match self.0.get(&(addr + i as u64)) {
                    Some(b) => out.push(*b),
                    None => anyhow::bail!("unmapped address {:#x}", addr + i as u64),
                }
            }
            Ok(out)
        }
    }

    fn table() -> SymbolTable {
        SymbolTable::from_parts(
            vec![
                Function { name: "main.inner".to_string(), entry: 0x1000, end: 0x1100 },
                Function { name: "main.outer".to_string(), entry: 0x1100, end: 0x1200 },
            ],
            LineTable::empty(),
            HashMap::new(),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_unwind_follows_bp_chain() {
        let table = table();
        let mut mem = MapMem::new();
        // inner (bp=0x7f00) -> outer (bp=0x7f80)
        mem.put_u64(0x7f00, 0x7f80); // 保存済みRBP
        mem.put_u64(0x7f08, 0x1150); // リターンアドレス（main.outer内）

        let frames = FrameUnwinder::new(&table)
            .unwind(&mem, 0x1020, 0x7ef0, 0x7f00, 10)
            .expect("unwind");

        assert_eq!(frames.len(), 2, "chain should stop at unmapped frame");
        assert_eq!(frames[0].pc, 0x1020);
        assert_eq!(frames[0].function.as_deref(), Some("main.inner"));
        assert_eq!(frames[0].cfa, 0x7f10);
        assert_eq!(frames[1].pc, 0x1150);
        assert_eq!(frames[1].function.as_deref(), Some("main.outer"));
        assert_eq!(frames[1].cfa, 0x7f90);
    }

    #[test]
    fn test_unwind_respects_depth() {
        let table = table();
        let mut mem = MapMem::new();
        mem.put_u64(0x7f00, 0x7f80);
        mem.put_u64(0x7f08, 0x1150);
        mem.put_u64(0x7f80, 0x7fc0);
        mem.put_u64(0x7f88, 0x1160);

        let frames = FrameUnwinder::new(&table)
            .unwind(&mem, 0x1020, 0x7ef0, 0x7f00, 1)
            .expect("unwind");
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_unwind_with_zero_bp_yields_single_frame() {
        let table = table();
        let mem = MapMem::new();
        let frames = FrameUnwinder::new(&table)
            .unwind(&mem, 0x1020, 0x7ef0, 0, 10)
            .expect("unwind");
        assert_eq!(frames.len(), 1);
    }
}
