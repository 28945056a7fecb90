//! テスト用のトレースゲートウェイ
//!
//! 実際のカーネルの代わりに、スクリプト化した停止イベントと
//! スパースなバイトマップで応答するフェイク実装。各クレートの
//! テストから共用します。

use crate::{Registers, Result, Tid, TraceOps};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// フェイクの内部状態
///
/// テスト側はFakeHandle越しにこの状態を直接覗き、書き換えられます。
#[derive(Default)]
pub struct FakeState {
    pub pid: Tid,
    /// list_threadsが返すスレッド一覧
    pub threads: Vec<Tid>,
    /// トレース対象のメモリ（未設定の番地は0として読める）
    pub memory: HashMap<u64, u8>,
    /// 読み取りを失敗させる番地
    pub unreadable: HashSet<u64>,
    /// スレッドごとのレジスタ
    pub regs: HashMap<Tid, Registers>,
    /// wait_anyが順に返すイベント
    pub events: VecDeque<(Tid, WaitStatus)>,
    /// wait(tid)向けのイベント（該当が無ければSIGTRAP停止を返す）
    pub thread_events: VecDeque<(Tid, WaitStatus)>,
    /// クローンイベントのevent_messageが返す子tid
    pub clone_child: Option<Tid>,
    /// 再開時に適用するPC（スレッドが走って停止した位置を表現する）
    pub resume_pc: HashMap<Tid, u64>,
    /// is_stoppedの応答
    pub all_stopped: bool,
    /// 記録: cont/single_step/attach/detach/stop_thread/kill/set_trace_options
    pub resumed: Vec<Tid>,
    pub stepped: Vec<Tid>,
    pub attached: Vec<Tid>,
    pub detached: Vec<Tid>,
    pub halted: Vec<Tid>,
    pub killed: Vec<(Tid, Signal)>,
    pub traced_options: Vec<Tid>,
}

impl FakeState {
    /// メモリへバイト列を書き込む
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    /// メモリへリトルエンディアンのu64を書き込む
    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// メモリからバイト列を読む（未設定は0）
    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.memory.get(&(addr + i as u64)).copied().unwrap_or(0))
            .collect()
    }

    /// 指定スレッドのレジスタを書き換える
    pub fn with_regs(&mut self, tid: Tid, f: impl FnOnce(&mut Registers)) {
        let entry = self.regs.entry(tid).or_insert_with(Registers::zeroed);
        f(entry);
    }

    /// wait_anyのイベントを追加する
    pub fn push_event(&mut self, tid: Tid, status: WaitStatus) {
        self.events.push_back((tid, status));
    }
}

/// テストから状態を操作するためのハンドル
pub type FakeHandle = Arc<Mutex<FakeState>>;

/// フェイクのトレースゲートウェイ
pub struct FakeTraceOps {
    state: FakeHandle,
}

impl FakeTraceOps {
    /// フェイクと、その状態を覗くハンドルの組を作る
    pub fn new(pid: Tid) -> (Self, FakeHandle) {
        let state = Arc::new(Mutex::new(FakeState {
            pid,
            threads: vec![pid],
            all_stopped: true,
            ..FakeState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }
}

impl TraceOps for FakeTraceOps {
    fn spawn(&mut self, _program: &Path, _args: &[String]) -> Result<Tid> {
        Ok(self.lock().pid)
    }

    fn attach(&mut self, tid: Tid) -> Result<()> {
        self.lock().attached.push(tid);
        Ok(())
    }

    fn detach(&mut self, tid: Tid, _sig: Option<Signal>) -> Result<()> {
        self.lock().detached.push(tid);
        Ok(())
    }

    fn cont(&mut self, tid: Tid, _sig: Option<Signal>) -> Result<()> {
        let mut st = self.lock();
        st.resumed.push(tid);
        if let Some(pc) = st.resume_pc.remove(&tid) {
            st.with_regs(tid, |regs| regs.set_pc(pc));
        }
        Ok(())
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        let mut st = self.lock();
        st.stepped.push(tid);
        // 簡易な実行モデル: 1ステップでPCを1命令（1バイト）進める
        st.with_regs(tid, |r| {
            let pc = r.pc();
            r.set_pc(pc + 1);
        });
        Ok(())
    }

    fn set_trace_options(&mut self, tid: Tid) -> Result<()> {
        self.lock().traced_options.push(tid);
        Ok(())
    }

    fn event_message(&mut self, _tid: Tid) -> Result<u64> {
        let st = self.lock();
        st.clone_child.map(|t| t as u64).ok_or(Errno::EINVAL)
    }

    fn peek_memory(&mut self, _pid: Tid, addr: u64, len: usize) -> Result<Vec<u8>> {
        let st = self.lock();
        for i in 0..len {
            if st.unreadable.contains(&(addr + i as u64)) {
                return Err(Errno::EIO);
            }
        }
        Ok(st.read_bytes(addr, len))
    }

    fn poke_memory(&mut self, _pid: Tid, addr: u64, data: &[u8]) -> Result<()> {
        self.lock().write_bytes(addr, data);
        Ok(())
    }

    fn get_regs(&mut self, tid: Tid) -> Result<Registers> {
        Ok(self
            .lock()
            .regs
            .get(&tid)
            .copied()
            .unwrap_or_else(Registers::zeroed))
    }

    fn set_regs(&mut self, tid: Tid, regs: Registers) -> Result<()> {
        self.lock().regs.insert(tid, regs);
        Ok(())
    }

    fn wait(&mut self, tid: Tid) -> Result<WaitStatus> {
        let mut st = self.lock();
        if let Some(pos) = st.thread_events.iter().position(|(t, _)| *t == tid) {
            let (_, status) = st.thread_events.remove(pos).expect("position valid");
            return Ok(status);
        }
        // 既定ではトラップ停止として応答する
        Ok(WaitStatus::Stopped(
            nix::unistd::Pid::from_raw(tid),
            Signal::SIGTRAP,
        ))
    }

    fn wait_any(&mut self) -> Result<(Tid, WaitStatus)> {
        self.lock().events.pop_front().ok_or(Errno::ECHILD)
    }

    fn stop_thread(&mut self, _pid: Tid, tid: Tid) -> Result<()> {
        self.lock().halted.push(tid);
        Ok(())
    }

    fn kill(&mut self, pid: Tid, sig: Signal) -> Result<()> {
        self.lock().killed.push((pid, sig));
        Ok(())
    }

    fn list_threads(&mut self, _pid: Tid) -> Result<Vec<Tid>> {
        Ok(self.lock().threads.clone())
    }

    fn is_stopped(&mut self, _pid: Tid, _tid: Tid) -> bool {
        self.lock().all_stopped
    }
}
