//! プロセス制御の中核
//!
//! トレース対象プロセス1つにつき1つのProcessがライフサイクル全体を
//! 所有します。ブレークポイントテーブル、スレッドテーブル、
//! ゴルーチンの列挙キャッシュ、そしてContinue / Next / Stepの
//! オーケストレーションを担います。公開操作は直列に呼ばれる前提で、
//! トレースシステムコールだけがシリアライザのワーカーに逃がされます。

use crate::arch::Arch;
use crate::breakpoint::Breakpoint;
use crate::errors::{DebugError, Result};
use crate::goroutine::{parse_g, G, GStatus};
use crate::scope::EvalScope;
use crate::thread::Thread;
use crate::version::GoVersion;
use nix::errno::Errno;
use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use rindo_dwarf::{eval, Frame, FrameUnwinder, SymbolTable};
use rindo_target::{PtraceOps, Registers, Serializer, Tid, TraceOps};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// ランタイムのbreakpoint組み込み関数
const RUNTIME_BREAKPOINT: &str = "runtime.breakpoint";

/// ゴルーチン終了処理の関数名
const RUNTIME_GOEXIT: &str = "runtime.goexit";

/// デバッグ対象のプロセス
pub struct Process {
    pub pid: Tid,
    /// アドレスをキーにしたブレークポイントテーブル
    breakpoints: HashMap<u64, Breakpoint>,
    /// OSスレッドIDをキーにしたスレッドテーブル
    threads: HashMap<Tid, Thread>,
    current_thread: Tid,
    /// 既定で評価対象になるゴルーチン
    ///
    /// 通常はカレントスレッドのゴルーチンと一致し、スレッドに載っていない
    /// ゴルーチンへSwitchGoroutineしたときだけ食い違う。
    selected_goroutine: Option<G>,
    arch: Arch,
    symbols: SymbolTable,
    /// ユーザ可視の停止の間だけ有効なゴルーチン列挙キャッシュ
    all_g_cache: Option<Vec<G>>,
    breakpoint_id: usize,
    temp_breakpoint_id: usize,
    halt_requested: bool,
    exited: bool,
    exit_status: i32,
    serializer: Arc<Serializer>,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// forkとexecveはシリアライザのワーカースレッド上で行われ、以後の
    /// トレース操作がすべて同じスレッドから発行されることを保証します。
    pub fn launch<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        let program = program.as_ref().to_path_buf();
        let symbols = SymbolTable::load(&program)?;
        let serializer = Arc::new(Serializer::spawn(Box::new(PtraceOps::new()))?);

        let args = args.to_vec();
        let pid = serializer
            .exec(move |ops| ops.spawn(&program, &args))
            .map_err(|_| DebugError::Trace(Errno::ESRCH))??;

        let mut process = Self::with_serializer(pid, serializer, symbols);
        process.initialize(false)?;
        Ok(process)
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: Tid) -> Result<Self> {
        let exe = find_executable(pid)?;
        let symbols = SymbolTable::load(exe)?;
        let serializer = Arc::new(Serializer::spawn(Box::new(PtraceOps::new()))?);
        let mut process = Self::with_serializer(pid, serializer, symbols);
        process.initialize(true)?;
        Ok(process)
    }

    /// 任意のトレースゲートウェイでプロセスを構成する
    ///
    /// テスト用のフェイクやリモートターゲットの実装を差し込むための
    /// 構成子。呼び出し後にinitializeを呼ぶ必要があります。
    pub fn with_trace_ops(
        pid: Tid,
        ops: Box<dyn TraceOps>,
        symbols: SymbolTable,
    ) -> Result<Self> {
        let serializer = Arc::new(Serializer::spawn(ops)?);
        Ok(Self::with_serializer(pid, serializer, symbols))
    }

    fn with_serializer(pid: Tid, serializer: Arc<Serializer>, symbols: SymbolTable) -> Self {
        Self {
            pid,
            breakpoints: HashMap::new(),
            threads: HashMap::new(),
            current_thread: pid,
            selected_goroutine: None,
            arch: Arch::host(),
            symbols,
            all_g_cache: None,
            breakpoint_id: 0,
            temp_breakpoint_id: 0,
            halt_requested: false,
            exited: false,
            exit_status: 0,
            serializer,
        }
    }

    /// トレースの初期化を行う
    ///
    /// アタッチの場合は停止を待ち、スレッド一覧を取り込んだうえで
    /// トレース対象からランタイムのバージョンとリンカ種別を読み取り、
    /// TLS内のgポインタ位置を確定します。最後にカレントスレッドの
    /// ゴルーチンを既定の選択にします。
    pub fn initialize(&mut self, attach: bool) -> Result<()> {
        if attach {
            let pid = self.pid;
            self.exec_trace(move |ops| ops.attach(pid))??;
            let status = self.exec_trace(move |ops| ops.wait(pid))??;
            if let WaitStatus::Exited(_, code) = status {
                self.post_exit(code);
                return Err(self.exited_error());
            }
        }

        self.update_thread_list()?;

        let (version, is_extld) = self.read_go_information()?;
        self.arch.set_g_struct_offset(&version, is_extld);

        // gポインタ位置が決まるまではGetGできないため、選択はここで行う
        self.selected_goroutine = self.curr()?.get_g(&self.arch, &self.symbols).ok();
        Ok(())
    }

    /// トレース対象からバージョン文字列と外部リンカ使用の有無を読む
    fn read_go_information(&self) -> Result<(GoVersion, bool)> {
        let thread = self.curr()?;
        let raw = eval::read_package_string(&self.symbols, thread, "runtime.buildVersion")?;
        let version = GoVersion::parse(&raw).ok_or_else(|| {
            DebugError::Symbols(anyhow::anyhow!("could not parse version string {:?}", raw))
        })?;
        // 外部アセンブラでリンクされたバイナリはTLSの配置が変わる
        let is_extld = self
            .symbols
            .producers()
            .iter()
            .any(|p| p.starts_with("GNU AS"));
        debug!(?version, is_extld, "runtime information loaded");
        Ok((version, is_extld))
    }

    /// シリアライザ上でトレース操作を実行する
    fn exec_trace<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TraceOps) -> T + Send + 'static,
    {
        self.serializer.exec(f).map_err(|closed| DebugError::ProcessExited {
            pid: self.pid,
            status: closed.status,
        })
    }

    /// プロセスが終了したとみなされているか
    pub fn exited(&self) -> bool {
        self.exited
    }

    /// いずれかのスレッドが実行中か
    pub fn running(&self) -> bool {
        self.threads.values().any(|t| t.running())
    }

    /// カレントスレッド
    pub fn current_thread(&self) -> Result<&Thread> {
        self.curr()
    }

    /// スレッド一覧
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// ブレークポイントテーブル（一時ブレークポイントも含む）
    pub fn breakpoints(&self) -> &HashMap<u64, Breakpoint> {
        &self.breakpoints
    }

    /// 既定で評価対象になるゴルーチン
    pub fn selected_goroutine(&self) -> Option<&G> {
        self.selected_goroutine.as_ref()
    }

    /// シンボルテーブル
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    fn curr(&self) -> Result<&Thread> {
        self.threads
            .get(&self.current_thread)
            .ok_or(DebugError::UnknownThread {
                tid: self.current_thread,
            })
    }

    fn exited_error(&self) -> DebugError {
        DebugError::ProcessExited {
            pid: self.pid,
            status: self.exit_status,
        }
    }

    /// プロセス終了を記録し、シリアライザを停止する
    ///
    /// 以後の公開操作はすべてProcessExitedで失敗します。
    fn post_exit(&mut self, status: i32) {
        self.exited = true;
        self.exit_status = status;
        self.serializer.shutdown(status);
    }

    /// 消えたプロセスへの操作エラーを終了として扱い直す
    fn exit_guard(&mut self, err: DebugError) -> DebugError {
        match err {
            DebugError::Trace(Errno::ESRCH) if !self.exited => {
                self.post_exit(0);
                self.exited_error()
            }
            DebugError::ProcessExited { status, .. } if !self.exited => {
                self.post_exit(status);
                self.exited_error()
            }
            err => err,
        }
    }

    // ---- ブレークポイント管理 ----

    /// 指定アドレスにブレークポイントを設定する
    pub fn set_breakpoint(&mut self, addr: u64) -> Result<&Breakpoint> {
        self.set_breakpoint_internal(addr, false)
    }

    /// Next用の一時ブレークポイントを設定する
    pub fn set_temp_breakpoint(&mut self, addr: u64) -> Result<&Breakpoint> {
        self.set_breakpoint_internal(addr, true)
    }

    fn set_breakpoint_internal(&mut self, addr: u64, temp: bool) -> Result<&Breakpoint> {
        if self.breakpoints.contains_key(&addr) {
            return Err(DebugError::BreakpointExists { addr });
        }
        let id = if temp {
            self.temp_breakpoint_id += 1;
            self.temp_breakpoint_id
        } else {
            self.breakpoint_id += 1;
            self.breakpoint_id
        };
        let mut bp = Breakpoint::new(id, addr, temp);
        {
            // 設置はシグナル停止中のスレッド経由でしか行えない
            let thread = self.curr()?;
            bp.install(thread, &self.arch)?;
        }
        Ok(self.breakpoints.entry(addr).or_insert(bp))
    }

    /// ブレークポイントを削除して元の命令を復元する
    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<Breakpoint> {
        let bp_addr = match self.find_breakpoint(addr) {
            Some(bp) => bp.addr,
            None => return Err(DebugError::NoBreakpoint { addr }),
        };
        {
            let bp = self
                .breakpoints
                .get(&bp_addr)
                .ok_or(DebugError::NoBreakpoint { addr })?;
            let thread = self.curr()?;
            bp.clear(thread, &self.arch)?;
        }
        self.breakpoints
            .remove(&bp_addr)
            .ok_or(DebugError::NoBreakpoint { addr })
    }

    /// PCからブレークポイントを検索する
    ///
    /// トラップ実行後のPC（アドレス+トラップ長）を先に試し、
    /// 次にアドレスそのものを照合します。
    pub fn find_breakpoint(&self, pc: u64) -> Option<&Breakpoint> {
        let post_trap = pc.wrapping_sub(self.arch.breakpoint_size() as u64);
        self.breakpoints
            .get(&post_trap)
            .or_else(|| self.breakpoints.get(&pc))
    }

    /// IDからブレークポイントを検索する
    pub fn find_breakpoint_by_id(&self, id: usize) -> Option<&Breakpoint> {
        self.breakpoints.values().find(|bp| bp.id == id)
    }

    /// すべての一時ブレークポイントを片付ける
    fn clear_temp_breakpoints(&mut self) -> Result<()> {
        let addrs: Vec<u64> = self
            .breakpoints
            .values()
            .filter(|bp| bp.temp)
            .map(|bp| bp.addr)
            .collect();
        for addr in addrs {
            self.clear_breakpoint(addr)?;
        }
        for thread in self.threads.values_mut() {
            if thread
                .current_breakpoint
                .as_ref()
                .map(|bp| bp.temp)
                .unwrap_or(false)
            {
                thread.current_breakpoint = None;
            }
        }
        Ok(())
    }

    // ---- 実行制御 ----

    /// 再開前の共通処理を挟んで実行する
    ///
    /// ゴルーチンキャッシュとラッチはすべての実行操作の前に無効化されます。
    fn run<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.all_g_cache = None;
        if self.exited {
            return Err(self.exited_error());
        }
        for thread in self.threads.values_mut() {
            thread.current_breakpoint = None;
        }
        f(self)
    }

    /// 実行を再開し、条件の成立した停止までループする
    ///
    /// 一時ブレークポイントで停止した場合は一時ブレークポイントを
    /// すべて片付けてから戻ります。ラッチの無い停止（手動停止）は
    /// そのままユーザへ返します。
    pub fn continue_execution(&mut self) -> Result<()> {
        loop {
            self.continue_once()?;
            // ラッチが無ければ手動停止が要求されたとみなす
            let exit_anyway = self.curr()?.current_breakpoint.is_none();
            self.run_breakpoint_conditions()?;
            let thread = self.curr()?;
            if thread.on_triggered_breakpoint() {
                if thread.on_triggered_temp_breakpoint() {
                    self.clear_temp_breakpoints()?;
                }
                return Ok(());
            }
            if exit_anyway {
                return Ok(());
            }
            // 条件が成立しないブレークポイントだったので再開する
            debug!("breakpoint condition not met, resuming");
        }
    }

    /// 各スレッドのブレークポイント条件を評価し、カレントを切り替える
    ///
    /// 一時ブレークポイントにヒットしたスレッドを最優先、次に通常の
    /// ブレークポイントにヒットしたスレッドを選びます。同時ヒットの
    /// 順序はテーブルの走査順（1回の走査で最初に見つかったもの）です。
    fn run_breakpoint_conditions(&mut self) -> Result<()> {
        let mut triggered: Option<Tid> = None;
        let mut temp_triggered: Option<Tid> = None;

        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            let met = {
                let Some(thread) = self.threads.get(&tid) else {
                    continue;
                };
                match &thread.current_breakpoint {
                    Some(bp) => bp.check_condition(thread, &self.arch, &self.symbols),
                    None => continue,
                }
            };
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.breakpoint_condition_met = met;
                if thread.on_triggered_breakpoint() {
                    if thread.on_triggered_temp_breakpoint() {
                        if temp_triggered.is_none() {
                            temp_triggered = Some(tid);
                        }
                    } else if triggered.is_none() {
                        triggered = Some(tid);
                    }
                }
            }
        }

        let current_on_temp = self.curr()?.on_triggered_temp_breakpoint();
        let current_on_bp = self.curr()?.on_triggered_breakpoint();
        if let Some(tid) = temp_triggered {
            if !current_on_temp {
                self.switch_thread(tid)?;
            }
        } else if let Some(tid) = triggered {
            if !current_on_bp {
                self.switch_thread(tid)?;
            }
        }
        Ok(())
    }

    /// 1回の再開と停止の処理（条件は評価しない）
    fn continue_once(&mut self) -> Result<()> {
        // ブレークポイント上で停止しているスレッドは先にトラップを跨がせる
        let latched: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| t.current_breakpoint.is_some())
            .map(|t| t.id)
            .collect();
        for tid in latched {
            if let Some(thread) = self.threads.get_mut(&tid) {
                match thread.step(&self.breakpoints, &self.arch, &self.symbols) {
                    Ok(()) => thread.current_breakpoint = None,
                    Err(DebugError::ThreadBlocked) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        // 全スレッドを再開する
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in &tids {
            let result = match self.threads.get_mut(tid) {
                Some(thread) => thread.resume(),
                None => continue,
            };
            if let Err(err) = result {
                return Err(self.exit_guard(err));
            }
        }

        self.run(|process| {
            let event = process.trap_wait()?;
            process.halt_stopped_world(event)?;
            process.switch_thread(event)?;
            process.set_extra_breakpoints()?;

            // ランタイムのbreakpoint組み込み関数で停止した場合は
            // 2命令進めてユーザコードへ戻す
            let function = process.curr()?.location(&process.symbols)?.function;
            if function.as_deref() == Some(RUNTIME_BREAKPOINT) {
                for _ in 0..2 {
                    let tid = process.current_thread;
                    if let Some(thread) = process.threads.get_mut(&tid) {
                        thread.step(&process.breakpoints, &process.arch, &process.symbols)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// いずれかのスレッドの停止イベントを待って分類する
    ///
    /// コア全体で唯一のサスペンションポイント。スレッドの生成・消滅も
    /// ここで反映されます。停止したスレッドのtidを返します。
    fn trap_wait(&mut self) -> Result<Tid> {
        loop {
            let (wtid, status) = self.exec_trace(|ops| ops.wait_any())??;
            match status {
                WaitStatus::Exited(_, code) if wtid == self.pid => {
                    self.post_exit(code);
                    return Err(self.exited_error());
                }
                WaitStatus::Exited(..) => {
                    // スレッドの終了はテーブルから取り除くだけでよい
                    self.threads.remove(&wtid);
                    continue;
                }
                WaitStatus::Signaled(_, sig, _) if wtid == self.pid => {
                    self.post_exit(128 + sig as i32);
                    return Err(self.exited_error());
                }
                WaitStatus::Signaled(..) => {
                    self.threads.remove(&wtid);
                    continue;
                }
                WaitStatus::PtraceEvent(_, _, event)
                    if event == Event::PTRACE_EVENT_CLONE as i32 =>
                {
                    // トレース中のスレッドが新しいスレッドを作った
                    let parent = wtid;
                    let child = self.exec_trace(move |ops| ops.event_message(parent))?? as Tid;
                    debug!(parent, child, "thread clone observed");
                    self.add_thread(child, false)?;
                    // クローン直後の停止を消費してから両方を再開する
                    let child_status = self.exec_trace(move |ops| ops.wait(child))??;
                    if matches!(child_status, WaitStatus::Exited(..)) {
                        self.threads.remove(&child);
                    } else if let Some(thread) = self.threads.get_mut(&child) {
                        thread.resume()?;
                    }
                    if let Some(thread) = self.threads.get_mut(&parent) {
                        thread.resume()?;
                    }
                    continue;
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let Some(thread) = self.threads.get_mut(&wtid) else {
                        // 把握していないスレッドの停止は無視する
                        continue;
                    };
                    thread.running = false;
                    thread.status = Some(status);
                    if self.halt_requested {
                        self.halt_requested = false;
                        return Ok(wtid);
                    }
                    if let Some(thread) = self.threads.get_mut(&wtid) {
                        thread.set_current_breakpoint(&self.breakpoints, &self.arch)?;
                    }
                    return Ok(wtid);
                }
                WaitStatus::Stopped(_, sig) => {
                    // 予期しないシグナルはそのスレッドへ届けて実行を続ける
                    if let Some(thread) = self.threads.get_mut(&wtid) {
                        thread.status = Some(status);
                    }
                    let tid = wtid;
                    self.exec_trace(move |ops| ops.cont(tid, Some(sig)))??;
                    continue;
                }
                _ => continue,
            }
        }
    }

    /// イベントを取ったスレッド以外をすべて停止させる
    ///
    /// 停止待ちの間にブレークポイントへ到達していたスレッドがあれば
    /// そのラッチも確認し、条件評価が全スレッドを見られるようにします。
    fn halt_stopped_world(&mut self, event: Tid) -> Result<()> {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            if tid == event {
                continue;
            }
            let halted = match self.threads.get_mut(&tid) {
                Some(thread) => thread.halt(),
                None => continue,
            };
            if let Err(err) = halted {
                return Err(self.exit_guard(err));
            }
            let trapped = matches!(
                self.threads.get(&tid).and_then(|t| t.status),
                Some(WaitStatus::Stopped(_, Signal::SIGTRAP))
            );
            if trapped {
                if let Some(thread) = self.threads.get_mut(&tid) {
                    thread.set_current_breakpoint(&self.breakpoints, &self.arch)?;
                }
            }
        }
        Ok(())
    }

    /// ステップオーバー
    ///
    /// 現在の文の後続行と呼び出し元への戻り先に一時ブレークポイントを
    /// 置き、同じゴルーチンでの到達だけが発火するよう条件を付けて
    /// 再開します。戻るときには一時ブレークポイントは残っていません。
    pub fn next(&mut self) -> Result<()> {
        if self.breakpoints.values().any(|bp| bp.temp) {
            return Err(DebugError::NextWhileNexting);
        }

        // 同じゴルーチンに留まるため、現在のゴルーチンを控える
        let g = self.curr()?.get_g(&self.arch, &self.symbols)?;

        // チャネル受信で停止中のゴルーチンの再開位置にも一時ブレーク
        // ポイントを置く。スケジューラが別のゴルーチンへ切り替えたとき、
        // ランタイムの中ではなく意味のある場所で停止させるため。
        self.set_chan_recv_breakpoints()?;

        let mut goroutine_exiting = false;
        if let Err(err) = self.set_next_breakpoints() {
            match err {
                DebugError::ThreadBlocked | DebugError::NoReturnAddress { .. } => {}
                DebugError::GoroutineExiting { id } => {
                    goroutine_exiting = id == g.id;
                }
                err => {
                    self.clear_temp_breakpoints()?;
                    return Err(err);
                }
            }
        }

        if !goroutine_exiting {
            for bp in self.breakpoints.values_mut() {
                if bp.temp {
                    bp.cond = Some(g.id);
                }
            }
        }

        self.continue_execution()
    }

    /// チャネル受信待ちの各ゴルーチンの再開位置に一時ブレークポイントを置く
    fn set_chan_recv_breakpoints(&mut self) -> Result<usize> {
        let mut count = 0;
        let all_g = self.goroutines_info()?;
        for g in &all_g {
            if !g.chan_recv_blocked() {
                continue;
            }
            let ret = match self.chan_recv_return_addr(g) {
                Ok(addr) => addr,
                // 戻り先が読めないゴルーチンは飛ばす
                Err(DebugError::NullAddress) => continue,
                Err(err) => return Err(err),
            };
            match self.set_temp_breakpoint(ret) {
                Ok(_) => count += 1,
                // 複数のゴルーチンが同じチャネルを待っている場合の重複は無視する
                Err(DebugError::BreakpointExists { .. })
                | Err(DebugError::AlreadyInstalled { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(count, "channel-receive breakpoints set");
        Ok(count)
    }

    /// チャネル受信から戻るときのアドレスを求める
    fn chan_recv_return_addr(&self, g: &G) -> Result<u64> {
        let frames = self.goroutine_stacktrace(g, 4)?;
        match frames.last() {
            Some(frame) if frame.pc != 0 => Ok(frame.pc),
            _ => Err(DebugError::NullAddress),
        }
    }

    /// 現在の文の後続と戻り先に一時ブレークポイントを設置する
    fn set_next_breakpoints(&mut self) -> Result<()> {
        let (pc, file) = {
            let thread = self.curr()?;
            if thread.blocked(&self.symbols) {
                return Err(DebugError::ThreadBlocked);
            }
            let pc = thread.pc()?;
            let loc = thread.location(&self.symbols)?;
            (pc, loc.file.unwrap_or_default())
        };
        let func = self
            .symbols
            .func_at(pc)
            .cloned()
            .ok_or_else(|| DebugError::Symbols(anyhow::anyhow!("no function at {:#x}", pc)))?;

        let mut pcs =
            self.symbols
                .line_pcs_between(func.entry, func.end.saturating_sub(1), &file);
        let ret = self.return_address()?;

        if pcs.is_empty() {
            // この関数に行情報が無く、戻り先がゴルーチンの終了処理なら
            // このゴルーチンはもう戻らない
            if let Some(ret_fn) = self.symbols.func_at(ret) {
                if ret_fn.name == RUNTIME_GOEXIT {
                    let g = self.curr()?.get_g(&self.arch, &self.symbols)?;
                    return Err(DebugError::GoroutineExiting { id: g.id });
                }
            }
        }

        pcs.push(ret);
        for target in pcs {
            if target == pc {
                continue;
            }
            match self.set_temp_breakpoint(target) {
                Ok(_) => {}
                Err(DebugError::BreakpointExists { .. })
                | Err(DebugError::AlreadyInstalled { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// カレントスレッドの呼び出し元への戻りアドレス
    fn return_address(&self) -> Result<u64> {
        let thread = self.curr()?;
        let regs = thread.registers()?;
        let frames = FrameUnwinder::new(&self.symbols)
            .unwind(thread, regs.pc(), regs.sp(), regs.bp(), 2)
            .map_err(DebugError::Symbols)?;
        if frames.len() < 2 {
            let function = frames
                .first()
                .and_then(|f| f.function.clone())
                .unwrap_or_default();
            return Err(DebugError::NoReturnAddress { function });
        }
        Ok(frames[1].pc)
    }

    /// 全スレッドを1命令だけ進める
    ///
    /// ブロッキング呼び出しの中にいるスレッドは飛ばします。
    /// ブレークポイント条件は評価しません。
    pub fn step(&mut self) -> Result<()> {
        self.run(|process| {
            let tids: Vec<Tid> = process.threads.keys().copied().collect();
            for tid in tids {
                let blocked = process
                    .threads
                    .get(&tid)
                    .map(|t| t.blocked(&process.symbols))
                    .unwrap_or(true);
                if blocked {
                    continue;
                }
                if let Some(thread) = process.threads.get_mut(&tid) {
                    thread.step(&process.breakpoints, &process.arch, &process.symbols)?;
                }
            }
            Ok(())
        })
    }

    /// 全スレッドを停止させる
    pub fn halt(&mut self) -> Result<()> {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            let halted = match self.threads.get_mut(&tid) {
                Some(thread) => thread.halt(),
                None => continue,
            };
            if let Err(err) = halted {
                return Err(self.exit_guard(err));
            }
        }
        Ok(())
    }

    /// 実行中のプロセスの停止を要求する
    ///
    /// Continueはラッチの無い停止として戻ります。
    pub fn request_manual_stop(&mut self) -> Result<()> {
        self.halt_requested = true;
        let pid = self.pid;
        self.exec_trace(move |ops| ops.kill(pid, Signal::SIGTRAP))??;
        Ok(())
    }

    /// プロセスから切り離す
    ///
    /// killしない場合は設置済みのブレークポイントをすべて復元してから
    /// 切り離し、プロセスを生かしたままにします。
    pub fn detach(&mut self, kill: bool) -> Result<()> {
        if self.exited {
            return Err(self.exited_error());
        }
        if self.running() {
            self.halt()?;
        }
        if !kill {
            let addrs: Vec<u64> = self.breakpoints.keys().copied().collect();
            for addr in addrs {
                self.clear_breakpoint(addr)?;
            }
        }
        let pid = self.pid;
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        self.exec_trace(move |ops| -> rindo_target::Result<()> {
            for tid in tids {
                ops.detach(tid, None)?;
            }
            if kill {
                ops.kill(pid, Signal::SIGINT)?;
            }
            Ok(())
        })??;
        Ok(())
    }

    // ---- スレッドの発見と管理 ----

    /// OSが報告するスレッド一覧をテーブルへ取り込む
    pub fn update_thread_list(&mut self) -> Result<()> {
        self.all_g_cache = None;
        let pid = self.pid;
        let tids = self.exec_trace(move |ops| ops.list_threads(pid))??;
        for tid in tids {
            self.add_thread(tid, tid != self.pid)?;
        }
        if !self.threads.contains_key(&self.current_thread) {
            if let Some(&tid) = self.threads.keys().next() {
                self.current_thread = tid;
            }
        }
        Ok(())
    }

    /// スレッドをテーブルへ追加する
    fn add_thread(&mut self, tid: Tid, attach: bool) -> Result<()> {
        if self.threads.contains_key(&tid) {
            return Ok(());
        }
        if attach {
            // クローンイベント経由で既にトレース中の場合、attachは
            // EPERMで失敗するがそのまま進んでよい
            match self.exec_trace(move |ops| ops.attach(tid))? {
                Ok(()) | Err(Errno::EPERM) => {}
                Err(err) => return Err(DebugError::Trace(err)),
            }
            let status = self.exec_trace(move |ops| ops.wait(tid))??;
            if let WaitStatus::Exited(..) = status {
                // 追跡する前に消えたスレッド
                return Ok(());
            }
        }
        self.exec_trace(move |ops| ops.set_trace_options(tid))??;
        let thread = Thread::new(tid, self.pid, Arc::clone(&self.serializer));
        self.threads.insert(tid, thread);
        Ok(())
    }

    /// プラットフォーム固有の追加ブレークポイントを設置する
    ///
    /// Linuxではスレッドの生成をクローンイベントで捕捉できるため
    /// 何も置く必要はありません。呼び出しごとに列挙キャッシュだけ
    /// 無効化します。
    fn set_extra_breakpoints(&mut self) -> Result<()> {
        self.all_g_cache = None;
        Ok(())
    }

    // ---- ゴルーチンの列挙と選択 ----

    /// 全ゴルーチンのスナップショットを列挙する
    ///
    /// 結果はユーザ可視の停止の間キャッシュされ、再開のたびに破棄され
    /// ます。列挙はトレース対象への書き込みを一切行いません。
    pub fn goroutines_info(&mut self) -> Result<Vec<G>> {
        if let Some(cache) = &self.all_g_cache {
            return Ok(cache.clone());
        }
        let layout = self
            .symbols
            .g_layout()
            .cloned()
            .ok_or_else(|| {
                DebugError::Symbols(anyhow::anyhow!("runtime.g layout not present in debug info"))
            })?;

        // 稼働中のスレッドとゴルーチンの対応を取る
        let mut thread_g: HashMap<i64, Tid> = HashMap::new();
        for thread in self.threads.values() {
            if thread.blocked(&self.symbols) {
                continue;
            }
            if let Ok(g) = thread.get_g(&self.arch, &self.symbols) {
                thread_g.insert(g.id, thread.id);
            }
        }

        let thread = self.curr()?;
        let allglen_addr = self.symbols.addr_for("runtime.allglen").ok_or_else(|| {
            DebugError::Symbols(anyhow::anyhow!("runtime.allglen not found"))
        })?;
        let allglen = read_word(thread, allglen_addr, 8)?;

        let entry_addr = match self.symbols.addr_for("runtime.allgs") {
            Some(addr) => addr,
            None => {
                // 古いランタイムはruntime.allgという名前で配列を公開していた
                let addr = self.symbols.addr_for("runtime.allg").ok_or_else(|| {
                    DebugError::Symbols(anyhow::anyhow!("runtime.allgs / runtime.allg not found"))
                })?;
                warn!("runtime.allgs not found, falling back to legacy runtime.allg");
                addr
            }
        };
        let base = read_word(thread, entry_addr, self.arch.ptr_size())?;

        let mut all_g = Vec::new();
        for i in 0..allglen {
            let slot = base + i * self.arch.ptr_size() as u64;
            let mut g = parse_g(thread, slot, true, &layout, &self.symbols)?;
            if let Some(&tid) = thread_g.get(&g.id) {
                g.thread = Some(tid);
                // 実スレッド上の位置情報のほうが正確なのでそちらを使う。
                // 読めない場合は列挙全体の失敗として呼び出し元へ返す。
                if let Some(t) = self.threads.get(&tid) {
                    g.current_loc = t.location(&self.symbols)?;
                }
            }
            if g.status != GStatus::Dead {
                all_g.push(g);
            }
        }

        self.all_g_cache = Some(all_g.clone());
        Ok(all_g)
    }

    /// IDでゴルーチンを検索する
    ///
    /// -1は現在の選択をそのまま返します。
    pub fn find_goroutine(&mut self, gid: i64) -> Result<Option<G>> {
        if gid == -1 {
            return Ok(self.selected_goroutine.clone());
        }
        let all_g = self.goroutines_info()?;
        all_g
            .into_iter()
            .find(|g| g.id == gid)
            .map(Some)
            .ok_or(DebugError::UnknownGoroutine { id: gid })
    }

    /// カレントスレッドを切り替える
    ///
    /// 選択中のゴルーチンも新しいスレッドのものに更新されます。
    pub fn switch_thread(&mut self, tid: Tid) -> Result<()> {
        if !self.threads.contains_key(&tid) {
            return Err(DebugError::UnknownThread { tid });
        }
        self.current_thread = tid;
        self.selected_goroutine = self.curr()?.get_g(&self.arch, &self.symbols).ok();
        Ok(())
    }

    /// 指定ゴルーチンを実行しているスレッドへ切り替える
    ///
    /// スレッドに載っていないゴルーチンの場合は選択だけを変え、以後の
    /// 評価はそのゴルーチンの保存済みレジスタを使います。
    pub fn switch_goroutine(&mut self, gid: i64) -> Result<()> {
        let g = match self.find_goroutine(gid)? {
            Some(g) => g,
            None => return Ok(()),
        };
        if let Some(tid) = g.thread {
            return self.switch_thread(tid);
        }
        self.selected_goroutine = Some(g);
        Ok(())
    }

    /// ゴルーチンのスタックトレースを取得する
    ///
    /// スレッドに載っているゴルーチンは実レジスタから、それ以外は
    /// スケジューラに保存された再開位置から巻き戻します。
    pub fn goroutine_stacktrace(&self, g: &G, depth: usize) -> Result<Vec<Frame>> {
        let thread = match g.thread {
            Some(tid) => self
                .threads
                .get(&tid)
                .ok_or(DebugError::UnknownThread { tid })?,
            None => self.curr()?,
        };
        let (pc, sp, bp) = if g.thread.is_some() {
            let regs = thread.registers()?;
            (regs.pc(), regs.sp(), regs.bp())
        } else {
            (g.pc, g.sp, g.bp)
        };
        FrameUnwinder::new(&self.symbols)
            .unwind(thread, pc, sp, bp, depth)
            .map_err(DebugError::Symbols)
    }

    /// ゴルーチンとフレーム番号から評価用スコープを作る
    pub fn convert_eval_scope(&mut self, gid: i64, frame: usize) -> Result<EvalScope> {
        let g = match self.find_goroutine(gid)? {
            Some(g) => g,
            None => {
                // 選択が無ければカレントスレッドのフレーム0
                let thread = self.curr()?;
                let regs = thread.registers()?;
                return Ok(EvalScope {
                    thread: thread.id,
                    pc: regs.pc(),
                    cfa: regs.bp().wrapping_add(16) as i64,
                });
            }
        };
        let frames = self.goroutine_stacktrace(&g, frame)?;
        if frame >= frames.len() {
            return Err(DebugError::FrameOutOfRange { id: g.id, frame });
        }
        let thread = g.thread.unwrap_or(self.current_thread);
        Ok(EvalScope {
            thread,
            pc: frames[frame].pc,
            cfa: frames[frame].cfa,
        })
    }

    // ---- 状態参照 ----

    /// カレントスレッドのレジスタ
    pub fn registers(&self) -> Result<Registers> {
        self.curr()?.registers()
    }

    /// カレントスレッドのPC
    pub fn pc(&self) -> Result<u64> {
        self.curr()?.pc()
    }

    /// カレントスレッドがラッチしているブレークポイント
    pub fn current_breakpoint(&self) -> Option<&Breakpoint> {
        self.curr().ok().and_then(|t| t.current_breakpoint.as_ref())
    }

    /// カレントスレッドの直近のwaitステータス
    pub fn status(&self) -> Option<WaitStatus> {
        self.curr().ok().and_then(|t| t.status)
    }

    /// アドレスからソース位置を検索する
    pub fn pc_to_line(&self, pc: u64) -> Option<(String, u64)> {
        self.symbols.pc_to_line(pc)
    }

    /// バイナリを構成するソースファイル一覧
    pub fn sources(&self) -> &[String] {
        self.symbols.sources()
    }

    /// バイナリに含まれる関数一覧
    pub fn funcs(&self) -> &[rindo_dwarf::Function] {
        self.symbols.funcs()
    }

    /// ファイル名と行番号からアドレスを求める
    pub fn find_file_location(&self, file: &str, line: u64) -> Result<u64> {
        self.symbols.line_to_pc(file, line).ok_or_else(|| {
            DebugError::Symbols(anyhow::anyhow!("could not find {}:{}", file, line))
        })
    }

    /// 関数名からブレークポイントを置けるアドレスを求める
    ///
    /// first_lineの場合は関数本体の最初の行を探します。エントリの行から
    /// 行番号を進めながら解決し、関数名が一致する最初の行を返します。
    /// 名前を部分的に含むだけの行（インライン化された補助関数）は
    /// 読み飛ばし、別の関数に到達したらエントリへ戻します。
    /// line_offsetが正ならエントリ行からのオフセットで解決します。
    pub fn find_function_location(
        &self,
        func_name: &str,
        first_line: bool,
        line_offset: u64,
    ) -> Result<u64> {
        let origin = self
            .symbols
            .lookup_func(func_name)
            .cloned()
            .ok_or_else(|| DebugError::FunctionNotFound {
                name: func_name.to_string(),
            })?;

        if first_line {
            let Some((filename, mut lineno)) = self.symbols.pc_to_line(origin.entry) else {
                return Ok(origin.entry);
            };
            // ソースファイル以外（アセンブリなど）はエントリをそのまま使う
            if !filename.ends_with(".go") {
                return Ok(origin.entry);
            }
            let limit = self.symbols.max_line(&filename).unwrap_or(lineno);
            loop {
                lineno += 1;
                if lineno > limit {
                    return Ok(origin.entry);
                }
                let Some(pc) = self.symbols.line_to_pc(&filename, lineno) else {
                    continue;
                };
                let Some(func) = self.symbols.func_at(pc) else {
                    continue;
                };
                if func.name == func_name {
                    return Ok(pc);
                }
                if func.name.contains(func_name) {
                    continue;
                }
                return Ok(origin.entry);
            }
        } else if line_offset > 0 {
            let (filename, lineno) = self.symbols.pc_to_line(origin.entry).ok_or_else(|| {
                DebugError::Symbols(anyhow::anyhow!(
                    "no line information for {}",
                    func_name
                ))
            })?;
            return self.find_file_location(&filename, lineno + line_offset);
        }

        Ok(origin.entry)
    }
}

/// ポインタ幅のリトルエンディアン値をスレッド経由で読む
fn read_word(thread: &Thread, addr: u64, size: usize) -> Result<u64> {
    let bytes = thread.read_memory(addr, size)?;
    let mut buf = [0u8; 8];
    for (i, b) in bytes.iter().take(8).enumerate() {
        buf[i] = *b;
    }
    Ok(u64::from_le_bytes(buf))
}

/// 実行中プロセスの実行ファイルパスを調べる
fn find_executable(pid: Tid) -> Result<std::path::PathBuf> {
    Ok(std::fs::read_link(format!("/proc/{}/exe", pid))?)
}
