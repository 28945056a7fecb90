//! ELFとDWARFの読み込み機能

use crate::lines::{LineRow, LineTable};
use crate::symbols::{Function, SymbolTable};
use crate::{gstruct, Result};
use object::{Object, ObjectSection, ObjectSymbol};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

type Reader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
pub struct DwarfLoader {
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<Reader>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // プロセスの生存期間中テーブルを保持するため、Box::leakで'staticライフタイムを得る
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        // DWARFセクションを読み込む
        let load_section = |id: gimli::SectionId| -> Result<Reader> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))?;

        Ok(Self { object_file, dwarf })
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<Reader> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 読み込んだデバッグ情報からシンボルテーブルを実体化する
    pub fn build_table(&self) -> Result<SymbolTable> {
        let functions = self.collect_functions()?;
        let lines = self.collect_lines()?;
        let globals = self.collect_globals();
        let producers = self.collect_producers()?;
        let g_layout = gstruct::extract(&self.dwarf)?;

        debug!(
            functions = functions.len(),
            files = lines.files().len(),
            globals = globals.len(),
            "symbol table built"
        );

        Ok(SymbolTable::from_parts(
            functions, lines, globals, producers, g_layout,
        ))
    }

    /// DW_TAG_subprogramから関数一覧を集める
    fn collect_functions(&self) -> Result<Vec<Function>> {
        let mut functions = Vec::new();
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                let Some(name_attr) = entry.attr_value(gimli::DW_AT_name)? else {
                    continue;
                };
                let name = self
                    .dwarf
                    .attr_string(&unit, name_attr)?
                    .to_string_lossy()
                    .into_owned();

                let Some((entry_pc, end)) = function_range(entry)? else {
                    continue;
                };
                functions.push(Function {
                    name,
                    entry: entry_pc,
                    end,
                });
            }
        }
        Ok(functions)
    }

    /// 行プログラムを走査して行テーブルを実体化する
    fn collect_lines(&self) -> Result<LineTable> {
        let mut files: Vec<String> = Vec::new();
        let mut file_index: HashMap<String, usize> = HashMap::new();
        let mut rows: Vec<LineRow> = Vec::new();

        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let Some(program) = unit.line_program.clone() else {
                continue;
            };
            let mut iter = program.rows();
            while let Some((header, row)) = iter.next_row()? {
                if row.end_sequence() {
                    continue;
                }
                let Some(line) = row.line() else {
                    continue;
                };
                let Some(name) = self.resolve_file(&unit, header, row) else {
                    continue;
                };
                let file = *file_index.entry(name.clone()).or_insert_with(|| {
                    files.push(name);
                    files.len() - 1
                });
                rows.push(LineRow {
                    address: row.address(),
                    file,
                    line: line.get(),
                    is_stmt: row.is_stmt(),
                });
            }
        }
        Ok(LineTable::new(files, rows))
    }

    /// 行エントリのファイル名をディレクトリ込みで解決する
    fn resolve_file(
        &self,
        unit: &gimli::Unit<Reader>,
        header: &gimli::LineProgramHeader<Reader>,
        row: &gimli::LineRow,
    ) -> Option<String> {
        let file = row.file(header)?;
        let mut name = String::new();
        if let Some(dir) = file.directory(header) {
            if let Ok(dir) = self.dwarf.attr_string(unit, dir) {
                name.push_str(&dir.to_string_lossy());
                if !name.ends_with('/') {
                    name.push('/');
                }
            }
        }
        let path = self.dwarf.attr_string(unit, file.path_name()).ok()?;
        name.push_str(&path.to_string_lossy());
        Some(name)
    }

    /// ELFシンボルテーブルからグローバルのアドレスを集める
    fn collect_globals(&self) -> HashMap<String, u64> {
        let mut globals = HashMap::new();
        for symbol in self.object_file.symbols() {
            if let Ok(name) = symbol.name() {
                if !name.is_empty() {
                    globals.insert(name.to_string(), symbol.address());
                }
            }
        }
        globals
    }

    /// 各コンパイル単位のプロデューサ文字列を集める
    fn collect_producers(&self) -> Result<Vec<String>> {
        let mut producers = Vec::new();
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();
            if let Some((_, entry)) = entries.next_dfs()? {
                if let Some(attr) = entry.attr_value(gimli::DW_AT_producer)? {
                    let producer = self
                        .dwarf
                        .attr_string(&unit, attr)?
                        .to_string_lossy()
                        .into_owned();
                    producers.push(producer);
                }
            }
        }
        Ok(producers)
    }
}

/// 関数DIEのアドレス範囲を取得する
fn function_range(
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<(u64, u64)>> {
    let low_pc = entry.attr_value(gimli::DW_AT_low_pc)?;
    let high_pc = entry.attr_value(gimli::DW_AT_high_pc)?;

    let (Some(low), Some(high)) = (low_pc, high_pc) else {
        return Ok(None);
    };

    let start = match low {
        gimli::AttributeValue::Addr(addr) => addr,
        _ => return Ok(None),
    };
    let end = match high {
        gimli::AttributeValue::Addr(addr) => addr,
        gimli::AttributeValue::Udata(offset) => start + offset,
        _ => return Ok(None),
    };
    Ok(Some((start, end)))
}
