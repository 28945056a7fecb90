//! ステップオーバーのテスト

mod common;

use common::{boot, push_trap_on_resume, MAIN_ENTRY, MAIN_LINE8, MAIN_LINE9, PID, RETURN_ADDR};
use rindo_core::DebugError;

#[test]
fn test_next_while_nexting_is_rejected() {
    let (mut process, _handle) = boot();

    process.set_temp_breakpoint(MAIN_LINE8).expect("leftover temp");
    let count_before = process.breakpoints().len();

    let err = process.next().expect_err("next while nexting");
    assert!(matches!(err, DebugError::NextWhileNexting));
    // テーブルは変化していない
    assert_eq!(process.breakpoints().len(), count_before);
}

#[test]
fn test_next_stops_on_following_line_and_cleans_temps() {
    let (mut process, handle) = boot();

    // スレッドはline7で停止中。次の停止はline9で起こることにする。
    push_trap_on_resume(&handle, PID, MAIN_LINE9 + 1);

    process.next().expect("next");

    // 一時ブレークポイントは1つも残らない
    assert!(
        process.breakpoints().values().all(|bp| !bp.temp),
        "no temp breakpoints after next"
    );
    assert!(process.breakpoints().is_empty());

    // 停止位置は次の文
    assert_eq!(process.pc().expect("pc"), MAIN_LINE9);

    // パッチした命令はすべて復元されている
    let st = handle.lock().expect("state");
    assert_eq!(st.read_bytes(MAIN_ENTRY, 1), vec![0x55]);
    assert_eq!(st.read_bytes(MAIN_LINE8, 1), vec![0x00]);
    assert_eq!(st.read_bytes(MAIN_LINE9, 1), vec![0x00]);
    assert_eq!(st.read_bytes(RETURN_ADDR, 1), vec![0x00]);
}

#[test]
fn test_next_places_conditioned_temps() {
    let (mut process, handle) = boot();

    // Continueがすぐ失敗するよう、イベントを積まずにNextを呼ぶ。
    // 一時ブレークポイントの設置内容だけを観察する。
    let err = process.next().expect_err("no events queued");
    assert!(matches!(err, DebugError::ProcessExited { .. } | DebugError::Trace(_)));

    let temps: Vec<_> = process.breakpoints().values().filter(|bp| bp.temp).collect();
    assert!(!temps.is_empty(), "temp breakpoints placed");
    // すべてカレントのゴルーチン（goid=1）を条件に持つ
    for bp in &temps {
        assert_eq!(bp.cond, Some(1), "temp at {:#x} conditioned on g1", bp.addr);
    }
    let addrs: Vec<u64> = temps.iter().map(|bp| bp.addr).collect();
    // 現在の関数の後続行
    assert!(addrs.contains(&MAIN_ENTRY));
    assert!(addrs.contains(&MAIN_LINE9));
    // 呼び出し元への戻り先
    assert!(addrs.contains(&RETURN_ADDR));
    // チャネル受信待ちのg2の再開位置（保存されたPC）
    assert!(addrs.contains(&MAIN_LINE8));

    let st = handle.lock().expect("state");
    for addr in addrs {
        assert_eq!(st.read_bytes(addr, 1), vec![0xCC], "trap present at {:#x}", addr);
    }
}

#[test]
fn test_goroutines_empty_when_none_live() {
    let (mut process, handle) = boot();

    {
        let mut st = handle.lock().expect("state");
        st.write_u64(0x2200, 0); // runtime.allglen = 0
    }
    let goroutines = process.goroutines_info().expect("enumerate");
    assert!(goroutines.is_empty(), "empty list, not an error");
}
