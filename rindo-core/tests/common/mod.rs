//! テスト共通のフィクスチャ
//!
//! フェイクのトレースゲートウェイ上に小さなGoプロセスの姿を作る。
//! main.mainで停止した1スレッドと、チャネル受信待ちを含む
//! ゴルーチンを数個持つ。

#![allow(dead_code)]

use rindo_core::Process;
use rindo_dwarf::{Function, GStructLayout, LineRow, LineTable, SymbolTable};
use rindo_target::testing::{FakeHandle, FakeTraceOps};
use std::collections::HashMap;

pub const PID: i32 = 1000;

/// main.mainのエントリ
pub const MAIN_ENTRY: u64 = 0x1000;
/// スレッドが停止している行（line 7）
pub const MAIN_LINE7: u64 = 0x1010;
pub const MAIN_LINE8: u64 = 0x1020;
pub const MAIN_LINE9: u64 = 0x1030;
/// main.helper内の戻りアドレス
pub const RETURN_ADDR: u64 = 0x1105;

/// g構造体のフィールドオフセット
pub fn g_layout() -> GStructLayout {
    GStructLayout {
        goid: 64,
        status: 16,
        waitreason: 24,
        sched: 40,
        sched_sp: 0,
        sched_pc: 8,
        sched_bp: None,
    }
}

/// フィクスチャのシンボルテーブル
pub fn make_table() -> SymbolTable {
    let functions = vec![
        Function { name: "main.main".to_string(), entry: 0x1000, end: 0x1100 },
        Function { name: "main.helper".to_string(), entry: 0x1100, end: 0x1200 },
        Function { name: "main.main.func1".to_string(), entry: 0x3000, end: 0x3040 },
        Function { name: "runtime.goexit".to_string(), entry: 0x5000, end: 0x5010 },
        Function { name: "runtime.breakpoint".to_string(), entry: 0x5100, end: 0x5110 },
    ];
    let lines = LineTable::new(
        vec!["/src/main.go".to_string()],
        vec![
            LineRow { address: 0x1000, file: 0, line: 5, is_stmt: true },
            LineRow { address: 0x3000, file: 0, line: 6, is_stmt: true },
            LineRow { address: 0x1010, file: 0, line: 7, is_stmt: true },
            LineRow { address: 0x1020, file: 0, line: 8, is_stmt: true },
            LineRow { address: 0x1030, file: 0, line: 9, is_stmt: true },
        ],
    );
    let globals: HashMap<String, u64> = [
        ("runtime.buildVersion".to_string(), 0x2000u64),
        ("runtime.allglen".to_string(), 0x2200),
        ("runtime.allgs".to_string(), 0x2208),
    ]
    .into_iter()
    .collect();
    SymbolTable::from_parts(functions, lines, globals, Vec::new(), Some(g_layout()))
}

/// フェイクの状態にトレース対象の初期メモリとレジスタを敷く
pub fn seed_state(handle: &FakeHandle) {
    let mut st = handle.lock().expect("fake state");
    st.threads = vec![PID];

    // runtime.buildVersion = "go1.5"
    st.write_u64(0x2000, 0x2100);
    st.write_u64(0x2008, 5);
    st.write_bytes(0x2100, b"go1.5");

    // ゴルーチン一覧: g1（実行中）, g2（チャネル受信待ち）, g3（死亡）
    st.write_u64(0x2200, 3); // runtime.allglen
    st.write_u64(0x2208, 0x4800); // runtime.allgs -> 配列
    st.write_u64(0x4800, 0x4000);
    st.write_u64(0x4808, 0x4100);
    st.write_u64(0x4810, 0x4200);

    // g1: goid=1, Running, sched.pc=line7
    st.write_u64(0x4000 + 64, 1);
    st.write_bytes(0x4000 + 16, &2u32.to_le_bytes());
    st.write_u64(0x4000 + 40, 0x7e00); // sched.sp
    st.write_u64(0x4000 + 48, MAIN_LINE7); // sched.pc

    // g2: goid=2, Waiting, waitreason="chan receive", sched.pc=line8
    st.write_u64(0x4100 + 64, 2);
    st.write_bytes(0x4100 + 16, &4u32.to_le_bytes());
    st.write_u64(0x4100 + 24, 0x4300); // waitreason ptr
    st.write_u64(0x4100 + 32, 12); // waitreason len
    st.write_u64(0x4100 + 40, 0x7d00);
    st.write_u64(0x4100 + 48, MAIN_LINE8);
    st.write_bytes(0x4300, b"chan receive");

    // g3: goid=3, Dead
    st.write_u64(0x4200 + 64, 3);
    st.write_bytes(0x4200 + 16, &6u32.to_le_bytes());

    // TLS: fs_base - 8 の位置にg1へのポインタ（go1.5のレイアウト）
    st.write_u64(0x7000 - 8, 0x4000);

    // main.mainのエントリには実際の命令バイトを置いておく
    st.write_bytes(MAIN_ENTRY, &[0x55]);

    // スレッドはmain.mainのline7で停止中。フレームポインタの
    // チェーンはmain.helperへの戻りアドレスを1段持つ。
    st.with_regs(PID, |regs| {
        regs.set_pc(MAIN_LINE7);
        regs.0.rsp = 0x7ef0;
        regs.0.rbp = 0x7f00;
        regs.0.fs_base = 0x7000;
    });
    st.write_u64(0x7f00, 0x7f80); // 保存済みRBP
    st.write_u64(0x7f08, RETURN_ADDR); // リターンアドレス
}

/// 初期化済みのProcessとフェイクの状態ハンドルを作る
pub fn boot() -> (Process, FakeHandle) {
    let (ops, handle) = FakeTraceOps::new(PID);
    seed_state(&handle);
    let mut process = Process::with_trace_ops(PID, Box::new(ops), make_table())
        .expect("construct process");
    process.initialize(false).expect("initialize");
    (process, handle)
}

/// SIGTRAP停止イベントを積む（PCは即座に書き換える）
pub fn push_trap(handle: &FakeHandle, tid: i32, stop_pc: u64) {
    use nix::sys::signal::Signal;
    use nix::sys::wait::WaitStatus;
    let mut st = handle.lock().expect("fake state");
    st.with_regs(tid, |regs| regs.set_pc(stop_pc));
    st.push_event(
        tid,
        WaitStatus::Stopped(nix::unistd::Pid::from_raw(tid), Signal::SIGTRAP),
    );
}

/// SIGTRAP停止イベントを積む（PCの書き換えは再開時に行う）
///
/// 「スレッドが走ってstop_pcで停止した」という経過を表現する。
pub fn push_trap_on_resume(handle: &FakeHandle, tid: i32, stop_pc: u64) {
    use nix::sys::signal::Signal;
    use nix::sys::wait::WaitStatus;
    let mut st = handle.lock().expect("fake state");
    st.resume_pc.insert(tid, stop_pc);
    st.push_event(
        tid,
        WaitStatus::Stopped(nix::unistd::Pid::from_raw(tid), Signal::SIGTRAP),
    );
}
