//! ランタイムのg構造体レイアウト解析

use crate::Result;
use gimli::{EndianSlice, RunTimeEndian};
use std::collections::HashMap;
use tracing::debug;

type Reader<'a> = EndianSlice<'a, RunTimeEndian>;

/// runtime.g内の各フィールドのバイトオフセット
///
/// ゴルーチン記述子をトレース対象のメモリから読み取る際に使用します。
/// schedフィールドはgobuf構造体で、その内部オフセットも併せて持ちます。
#[derive(Debug, Clone)]
pub struct GStructLayout {
    pub goid: u64,
    /// atomicstatusフィールド
    pub status: u64,
    pub waitreason: u64,
    /// sched（gobuf）フィールドの先頭
    pub sched: u64,
    /// gobuf内のspフィールド
    pub sched_sp: u64,
    /// gobuf内のpcフィールド
    pub sched_pc: u64,
    /// gobuf内のbpフィールド（古いランタイムには存在しない）
    pub sched_bp: Option<u64>,
}

/// DWARFからruntime.gとruntime.gobufのメンバオフセットを抽出する
pub fn extract<'a>(dwarf: &gimli::Dwarf<Reader<'a>>) -> Result<Option<GStructLayout>> {
    let mut g_members: Option<HashMap<String, u64>> = None;
    let mut gobuf_members: Option<HashMap<String, u64>> = None;

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        if g_members.is_none() {
            g_members = find_struct_members(dwarf, &unit, "runtime.g")?;
        }
        if gobuf_members.is_none() {
            gobuf_members = find_struct_members(dwarf, &unit, "runtime.gobuf")?;
        }
        if g_members.is_some() && gobuf_members.is_some() {
            break;
        }
    }

    let (Some(g), Some(gobuf)) = (g_members, gobuf_members) else {
        debug!("runtime.g / runtime.gobuf not found in debug info");
        return Ok(None);
    };

    let layout = GStructLayout {
        goid: member(&g, "goid")?,
        status: member(&g, "atomicstatus")?,
        waitreason: member(&g, "waitreason")?,
        sched: member(&g, "sched")?,
        sched_sp: member(&gobuf, "sp")?,
        sched_pc: member(&gobuf, "pc")?,
        sched_bp: gobuf.get("bp").copied(),
    };
    debug!(?layout, "resolved runtime.g layout");
    Ok(Some(layout))
}

fn member(members: &HashMap<String, u64>, name: &str) -> Result<u64> {
    members
        .get(name)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("struct member {} not found in debug info", name))
}

/// ユニット内で指定名の構造体を探し、メンバ名 -> オフセットを集める
fn find_struct_members<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    unit: &gimli::Unit<Reader<'a>>,
    type_name: &str,
) -> Result<Option<HashMap<String, u64>>> {
    let mut entries = unit.entries();
    while let Some((_, entry)) = entries.next_dfs()? {
        if entry.tag() != gimli::DW_TAG_structure_type {
            continue;
        }
        let Some(name) = entry_name(dwarf, unit, entry)? else {
            continue;
        };
        if name != type_name {
            continue;
        }

        // 構造体の直下のメンバを集める
        let mut members = HashMap::new();
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let child_entry = child.entry();
            if child_entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(member_name) = entry_name(dwarf, unit, child_entry)? else {
                continue;
            };
            // メンバオフセットは定数形式ならどのフォームでも受け付ける
            if let Some(attr) = child_entry.attr_value(gimli::DW_AT_data_member_location)? {
                if let Some(offset) = attr.udata_value() {
                    members.insert(member_name, offset);
                }
            }
        }
        return Ok(Some(members));
    }
    Ok(None)
}

/// DIEのDW_AT_nameを文字列として取り出す
fn entry_name<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    unit: &gimli::Unit<Reader<'a>>,
    entry: &gimli::DebuggingInformationEntry<Reader<'a>>,
) -> Result<Option<String>> {
    let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf.attr_string(unit, attr)?;
    Ok(Some(name.to_string_lossy().into_owned()))
}
