//! ゴルーチンの列挙と選択のテスト

mod common;

use common::{boot, MAIN_LINE7, PID};
use rindo_core::{DebugError, GStatus};

#[test]
fn test_goroutines_info_enumerates_live_goroutines() {
    let (mut process, _handle) = boot();

    let goroutines = process.goroutines_info().expect("enumerate");

    // 死んでいるg3は含まれない
    assert_eq!(goroutines.len(), 2);
    let g1 = goroutines.iter().find(|g| g.id == 1).expect("g1");
    let g2 = goroutines.iter().find(|g| g.id == 2).expect("g2");

    assert_eq!(g1.status, GStatus::Running);
    assert_eq!(g2.status, GStatus::Waiting);
    assert_eq!(g2.wait_reason, "chan receive");
    assert!(g2.chan_recv_blocked());

    // g1はカレントスレッドに載っている。載っているゴルーチンの位置は
    // スナップショットではなく実スレッドのものになる。
    assert_eq!(g1.thread, Some(PID));
    assert_eq!(g1.current_loc.pc, MAIN_LINE7);
    assert_eq!(g2.thread, None);
}

#[test]
fn test_thread_backed_goroutine_agrees_with_thread() {
    let (mut process, _handle) = boot();

    let mut arch = rindo_core::Arch::host();
    arch.set_g_struct_offset(&rindo_core::GoVersion::new(1, 5), false);

    let goroutines = process.goroutines_info().expect("enumerate");
    assert!(goroutines.iter().any(|g| g.thread.is_some()));
    for g in goroutines.iter().filter(|g| g.thread.is_some()) {
        let thread = process.current_thread().expect("thread");
        assert_eq!(thread.id, g.thread.expect("tid"));
        // スレッド側から読み直しても同じゴルーチンが返る
        let live = thread
            .get_g(&arch, process.symbols())
            .expect("get_g on backing thread");
        assert_eq!(live.id, g.id);
    }
}

#[test]
fn test_goroutines_info_is_cached_until_resume() {
    let (mut process, handle) = boot();

    let first = process.goroutines_info().expect("first");
    // メモリを書き換えてもキャッシュされた結果が返る
    {
        let mut st = handle.lock().expect("state");
        st.write_u64(0x2200, 0);
    }
    let second = process.goroutines_info().expect("second");
    assert_eq!(first.len(), second.len());

    // 実行操作でキャッシュは無効化される
    process.step().expect("step");
    let third = process.goroutines_info().expect("third");
    assert!(third.is_empty());
}

#[test]
fn test_switch_goroutine_without_thread_keeps_current_thread() {
    let (mut process, _handle) = boot();

    let before = process.current_thread().expect("current").id;
    process.switch_goroutine(2).expect("switch");

    assert_eq!(process.selected_goroutine().map(|g| g.id), Some(2));
    assert_eq!(process.current_thread().expect("current").id, before);
}

#[test]
fn test_switch_goroutine_on_thread_switches_thread() {
    let (mut process, _handle) = boot();

    process.switch_goroutine(2).expect("park selection on g2");
    // g1はスレッドに載っているので、切り替えはスレッド切り替えになる
    process.switch_goroutine(1).expect("switch to g1");
    assert_eq!(process.selected_goroutine().map(|g| g.id), Some(1));
    assert_eq!(process.current_thread().expect("current").id, PID);
}

#[test]
fn test_find_goroutine() {
    let (mut process, _handle) = boot();

    let g = process.find_goroutine(2).expect("find").expect("some");
    assert_eq!(g.id, 2);

    // -1は現在の選択を返す
    let selected = process.find_goroutine(-1).expect("selected");
    assert_eq!(selected.map(|g| g.id), Some(1));

    let err = process.find_goroutine(999).expect_err("unknown");
    assert!(matches!(err, DebugError::UnknownGoroutine { id } if id == 999));
}

#[test]
fn test_convert_eval_scope() {
    let (mut process, _handle) = boot();

    // スレッドに載っていないゴルーチンのフレーム0
    let scope = process.convert_eval_scope(2, 0).expect("scope");
    assert_eq!(scope.pc, 0x1020);
    assert_eq!(scope.thread, PID);

    // 深さを超えるフレームはエラー
    let err = process.convert_eval_scope(2, 5).expect_err("out of range");
    assert!(matches!(err, DebugError::FrameOutOfRange { id: 2, frame: 5 }));
}

#[test]
fn test_goroutine_stacktrace_of_current_thread() {
    let (mut process, _handle) = boot();

    let g = process.find_goroutine(1).expect("find").expect("some");
    let frames = process.goroutine_stacktrace(&g, 10).expect("stacktrace");

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].pc, MAIN_LINE7);
    assert_eq!(frames[0].function.as_deref(), Some("main.main"));
    assert_eq!(frames[1].function.as_deref(), Some("main.helper"));
}
