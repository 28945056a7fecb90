//! Continueと停止の分類のテスト

mod common;

use common::{boot, push_trap, MAIN_LINE7, PID};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use rindo_core::DebugError;

#[test]
fn test_continue_stops_on_breakpoint() {
    let (mut process, handle) = boot();

    process.set_breakpoint(MAIN_LINE7).expect("set breakpoint");
    // トラップ実行直後のPCはブレークポイントの1バイト先になる
    push_trap(&handle, PID, MAIN_LINE7 + 1);

    process.continue_execution().expect("continue");

    let bp = process.current_breakpoint().expect("breakpoint latched");
    assert_eq!(bp.addr, MAIN_LINE7);
    assert!(!bp.temp);
    // PCは元の命令が次に実行されるよう巻き戻されている
    assert_eq!(process.pc().expect("pc"), MAIN_LINE7);
    let thread = process.current_thread().expect("current thread");
    assert!(thread.breakpoint_condition_met);
    assert!(thread.on_triggered_breakpoint());

    let st = handle.lock().expect("state");
    assert!(st.resumed.contains(&PID), "thread was resumed");
}

#[test]
fn test_manual_stop_returns_without_latch() {
    let (mut process, handle) = boot();

    process.request_manual_stop().expect("request stop");
    {
        let st = handle.lock().expect("state");
        assert!(st.killed.contains(&(PID, Signal::SIGTRAP)));
    }
    // ブレークポイントとは無関係な位置で停止する
    push_trap(&handle, PID, 0x1042);

    process.continue_execution().expect("continue");

    assert!(process.current_breakpoint().is_none(), "manual stop carries no breakpoint");
}

#[test]
fn test_runtime_breakpoint_steps_past() {
    let (mut process, handle) = boot();

    // runtime.breakpointの中で停止した場合は2命令進めて戻る
    push_trap(&handle, PID, 0x5101);

    process.continue_execution().expect("continue");

    assert_eq!(process.pc().expect("pc"), 0x5103);
    let st = handle.lock().expect("state");
    assert_eq!(st.stepped.iter().filter(|&&t| t == PID).count(), 2);
}

#[test]
fn test_process_exit_short_circuits() {
    let (mut process, handle) = boot();

    {
        let mut st = handle.lock().expect("state");
        st.push_event(
            PID,
            WaitStatus::Exited(nix::unistd::Pid::from_raw(PID), 3),
        );
    }

    let err = process.continue_execution().expect_err("exit");
    assert!(matches!(err, DebugError::ProcessExited { pid, status } if pid == PID && status == 3));
    assert!(process.exited());

    // 以後の操作はすべてProcessExitedになる
    let err = process.step().expect_err("step after exit");
    assert!(matches!(err, DebugError::ProcessExited { .. }));
    let err = process.set_breakpoint(MAIN_LINE7).expect_err("set after exit");
    assert!(matches!(err, DebugError::ProcessExited { .. }));
}

#[test]
fn test_step_advances_each_thread() {
    let (mut process, handle) = boot();

    let pc_before = process.pc().expect("pc");
    process.step().expect("step");
    assert_eq!(process.pc().expect("pc"), pc_before + 1);

    let st = handle.lock().expect("state");
    assert_eq!(st.stepped, vec![PID]);
}

#[test]
fn test_switch_thread_roundtrip() {
    let (mut process, _handle) = boot();

    process.switch_thread(PID).expect("switch to existing");
    assert_eq!(process.current_thread().expect("current").id, PID);

    let err = process.switch_thread(9999).expect_err("unknown tid");
    assert!(matches!(err, DebugError::UnknownThread { tid } if tid == 9999));
    // 失敗してもカレントは変わらない
    assert_eq!(process.current_thread().expect("current").id, PID);
}
