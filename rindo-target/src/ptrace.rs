//! トレースシステムコールのゲートウェイ

use crate::{Registers, Result, Tid};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;

/// OSのトレース機構への操作一式
///
/// デバッガ本体はこのトレイト越しにのみカーネルへ触れます。
/// 実装を差し替えることでプラットフォームの違いやテスト用の
/// フェイクを吸収します。すべての呼び出しはシリアライザの
/// ワーカースレッド上で実行されます。
pub trait TraceOps: Send {
    /// 実行可能ファイルを起動し、最初の停止状態のままpidを返す
    fn spawn(&mut self, program: &Path, args: &[String]) -> Result<Tid>;

    /// スレッドへのアタッチ
    fn attach(&mut self, tid: Tid) -> Result<()>;

    /// スレッドの切り離し
    fn detach(&mut self, tid: Tid, sig: Option<Signal>) -> Result<()>;

    /// スレッドの実行再開（シグナルを指定すれば届けて再開する）
    fn cont(&mut self, tid: Tid, sig: Option<Signal>) -> Result<()>;

    /// 1命令だけ実行する
    fn single_step(&mut self, tid: Tid) -> Result<()>;

    /// スレッド作成イベントを追跡するオプションを設定する
    fn set_trace_options(&mut self, tid: Tid) -> Result<()>;

    /// 直近のトレースイベントに付随するメッセージ（クローンなら新スレッドのtid）
    fn event_message(&mut self, tid: Tid) -> Result<u64>;

    /// トレース対象のメモリを読み取る
    fn peek_memory(&mut self, pid: Tid, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// トレース対象のメモリへ書き込む
    fn poke_memory(&mut self, pid: Tid, addr: u64, data: &[u8]) -> Result<()>;

    /// レジスタを読み取る
    fn get_regs(&mut self, tid: Tid) -> Result<Registers>;

    /// レジスタを書き込む
    fn set_regs(&mut self, tid: Tid, regs: Registers) -> Result<()>;

    /// 指定スレッドの停止イベントを待つ
    fn wait(&mut self, tid: Tid) -> Result<WaitStatus>;

    /// いずれかのスレッドの停止イベントを待つ
    fn wait_any(&mut self) -> Result<(Tid, WaitStatus)>;

    /// 指定スレッドだけに停止シグナルを送る
    fn stop_thread(&mut self, pid: Tid, tid: Tid) -> Result<()>;

    /// プロセスへシグナルを送る
    fn kill(&mut self, pid: Tid, sig: Signal) -> Result<()>;

    /// プロセスに属するスレッドIDの一覧を取得する
    fn list_threads(&mut self, pid: Tid) -> Result<Vec<Tid>>;

    /// スレッドが停止状態かどうか
    fn is_stopped(&mut self, pid: Tid, tid: Tid) -> bool;
}

/// nixとprocfsによるLinux向けの実装
pub struct PtraceOps;

impl PtraceOps {
    pub fn new() -> Self {
        Self
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(pid: Tid, addr: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(format!("/proc/{}/mem", pid))?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAでメモリを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    /// word単位でしか読めないため、小さな読み取りに適しています。
    fn read_via_ptrace(pid: Tid, addr: u64, len: usize) -> Result<Vec<u8>> {
        let pid = nix::unistd::Pid::from_raw(pid);
        let word_size = std::mem::size_of::<libc::c_long>();
        let mut data = Vec::with_capacity(len);

        for offset in (0..len).step_by(word_size) {
            let word_addr = (addr as usize + offset) as nix::sys::ptrace::AddressType;
            let word = nix::sys::ptrace::read(pid, word_addr)?;
            let bytes = word.to_ne_bytes();
            let remaining = len - offset;
            data.extend_from_slice(&bytes[..remaining.min(word_size)]);
        }

        data.truncate(len);
        Ok(data)
    }
}

impl Default for PtraceOps {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceOps for PtraceOps {
    /// forkしてPTRACE_TRACEMEを設定し、execveで起動する
    ///
    /// 子プロセスはexecve直後のトラップで停止した状態で返されます。
    /// fork以降のトレース操作はすべてこの呼び出しと同じスレッドから
    /// 発行される必要があります。
    fn spawn(&mut self, program: &Path, args: &[String]) -> Result<Tid> {
        use nix::sys::wait::waitpid;
        use nix::unistd::{execve, fork, ForkResult};

        let program_cstring = path_to_cstring(program)?;
        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str()).map_err(|_| Errno::EINVAL)?);
        }

        // 環境変数は親プロセスから継承
        let mut env = Vec::new();
        for (key, val) in std::env::vars() {
            env.push(CString::new(format!("{}={}", key, val)).map_err(|_| Errno::EINVAL)?);
        }

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                // execve後の最初の停止を待つ
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => Ok(child.as_raw()),
                    _ => Err(Errno::ECHILD),
                }
            }
            ForkResult::Child => {
                if nix::sys::ptrace::traceme().is_err() {
                    std::process::exit(127);
                }
                let _ = execve(&program_cstring, &cstring_args, &env);
                // execveが失敗した場合のみ到達する
                std::process::exit(127);
            }
        }
    }

    fn attach(&mut self, tid: Tid) -> Result<()> {
        nix::sys::ptrace::attach(nix::unistd::Pid::from_raw(tid))
    }

    fn detach(&mut self, tid: Tid, sig: Option<Signal>) -> Result<()> {
        nix::sys::ptrace::detach(nix::unistd::Pid::from_raw(tid), sig)
    }

    fn cont(&mut self, tid: Tid, sig: Option<Signal>) -> Result<()> {
        nix::sys::ptrace::cont(nix::unistd::Pid::from_raw(tid), sig)
    }

    fn single_step(&mut self, tid: Tid) -> Result<()> {
        nix::sys::ptrace::step(nix::unistd::Pid::from_raw(tid), None)
    }

    fn set_trace_options(&mut self, tid: Tid) -> Result<()> {
        use nix::sys::ptrace::Options;
        nix::sys::ptrace::setoptions(
            nix::unistd::Pid::from_raw(tid),
            Options::PTRACE_O_TRACECLONE,
        )
    }

    fn event_message(&mut self, tid: Tid) -> Result<u64> {
        let msg = nix::sys::ptrace::getevent(nix::unistd::Pid::from_raw(tid))?;
        Ok(msg as u64)
    }

    fn peek_memory(&mut self, pid: Tid, addr: u64, len: usize) -> Result<Vec<u8>> {
        // まず/proc/pid/memで試し、失敗したらptraceにフォールバックする
        match Self::read_via_proc_mem(pid, addr, len) {
            Ok(data) => Ok(data),
            Err(_) => Self::read_via_ptrace(pid, addr, len),
        }
    }

    fn poke_memory(&mut self, pid: Tid, addr: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(format!("/proc/{}/mem", pid))
            .map_err(io_errno)?;
        file.seek(SeekFrom::Start(addr)).map_err(io_errno)?;
        file.write_all(data).map_err(io_errno)?;
        Ok(())
    }

    fn get_regs(&mut self, tid: Tid) -> Result<Registers> {
        let regs = nix::sys::ptrace::getregs(nix::unistd::Pid::from_raw(tid))?;
        Ok(Registers(regs))
    }

    fn set_regs(&mut self, tid: Tid, regs: Registers) -> Result<()> {
        nix::sys::ptrace::setregs(nix::unistd::Pid::from_raw(tid), regs.0)
    }

    fn wait(&mut self, tid: Tid) -> Result<WaitStatus> {
        use nix::sys::wait::{waitpid, WaitPidFlag};
        waitpid(
            nix::unistd::Pid::from_raw(tid),
            Some(WaitPidFlag::__WALL),
        )
    }

    fn wait_any(&mut self) -> Result<(Tid, WaitStatus)> {
        use nix::sys::wait::{waitpid, WaitPidFlag};
        let status = waitpid(
            nix::unistd::Pid::from_raw(-1),
            Some(WaitPidFlag::__WALL),
        )?;
        let tid = status.pid().map(|p| p.as_raw()).unwrap_or(0);
        Ok((tid, status))
    }

    fn stop_thread(&mut self, pid: Tid, tid: Tid) -> Result<()> {
        // nixにtgkillのラッパーが無いため直接システムコールを発行する
        let ret = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid as libc::pid_t,
                tid as libc::pid_t,
                libc::SIGSTOP,
            )
        };
        if ret == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn kill(&mut self, pid: Tid, sig: Signal) -> Result<()> {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
    }

    fn list_threads(&mut self, pid: Tid) -> Result<Vec<Tid>> {
        let entries = std::fs::read_dir(format!("/proc/{}/task", pid)).map_err(io_errno)?;
        let mut tids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_errno)?;
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                tids.push(tid);
            }
        }
        Ok(tids)
    }

    fn is_stopped(&mut self, pid: Tid, tid: Tid) -> bool {
        // /proc/pid/task/tid/statの状態フィールドが t (トレース停止) かを見る
        let path = format!("/proc/{}/task/{}/stat", pid, tid);
        let Ok(stat) = std::fs::read_to_string(path) else {
            return false;
        };
        // コマンド名に空白が含まれうるため、最後の ')' より後ろを読む
        let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r) else {
            return false;
        };
        matches!(rest.split_whitespace().next(), Some("t") | Some("T"))
    }
}

/// パスをCStringに変換する
fn path_to_cstring(path: &Path) -> Result<CString> {
    let s = path.to_str().ok_or(Errno::EINVAL)?;
    CString::new(s).map_err(|_| Errno::EINVAL)
}

/// std::io::Errorをerrnoに写す
fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}
