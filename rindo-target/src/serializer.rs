//! トレース要求の直列化

use crate::TraceOps;
use std::sync::mpsc;
use std::sync::Mutex;

/// ワーカーへ送る実行要求
type Job = Box<dyn FnOnce(&mut dyn TraceOps) + Send>;

/// シリアライザが停止済みであることを示すエラー
///
/// プロセス終了後の要求はすべてこのエラーになります。
/// statusには記録済みの終了ステータスが入ります。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerClosed {
    pub status: i32,
}

impl std::fmt::Display for SerializerClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trace serializer is shut down (status {})", self.status)
    }
}

impl std::error::Error for SerializerClosed {}

/// トレース操作を1本のOSスレッドへ直列化するワーカー
///
/// カーネルはアタッチを発行したスレッドからのトレースコマンドしか
/// 受け付けないため、プロセスの生存期間を通じて専用スレッドを1本
/// 確保し、すべての操作をチャネル越しのクロージャとして実行します。
pub struct Serializer {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    exit_status: Mutex<Option<i32>>,
}

impl Serializer {
    /// ワーカースレッドを起動する
    pub fn spawn(mut ops: Box<dyn TraceOps>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name("rindo-trace".to_string())
            .spawn(move || {
                // チャネルが閉じられるまで要求を順番に処理する
                for job in rx {
                    job(&mut *ops);
                }
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            exit_status: Mutex::new(None),
        })
    }

    /// トレース操作をワーカースレッド上で実行し、完了を待つ
    pub fn exec<T, F>(&self, f: F) -> Result<T, SerializerClosed>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TraceOps) -> T + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        {
            let guard = self.tx.lock().map_err(|_| self.closed())?;
            let tx = guard.as_ref().ok_or_else(|| self.closed())?;
            tx.send(Box::new(move |ops: &mut dyn TraceOps| {
                let _ = done_tx.send(f(ops));
            }))
            .map_err(|_| self.closed())?;
        }
        done_rx.recv().map_err(|_| self.closed())
    }

    /// チャネルを閉じてワーカーを終了させ、終了ステータスを記録する
    pub fn shutdown(&self, status: i32) {
        if let Ok(mut st) = self.exit_status.lock() {
            st.get_or_insert(status);
        }
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    /// 記録済みの終了ステータス（未終了ならNone）
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status.lock().ok().and_then(|st| *st)
    }

    fn closed(&self) -> SerializerClosed {
        SerializerClosed {
            status: self.exit_status().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTraceOps;

    #[test]
    fn test_exec_runs_on_single_worker_thread() {
        let (ops, _handle) = FakeTraceOps::new(100);
        let serializer = Serializer::spawn(Box::new(ops)).expect("spawn serializer");

        let first = serializer
            .exec(|_| std::thread::current().id())
            .expect("first exec");
        let second = serializer
            .exec(|_| std::thread::current().id())
            .expect("second exec");

        assert_eq!(first, second, "all trace calls must share one thread");
        assert_ne!(first, std::thread::current().id());
    }

    #[test]
    fn test_exec_after_shutdown_fails_with_status() {
        let (ops, _handle) = FakeTraceOps::new(100);
        let serializer = Serializer::spawn(Box::new(ops)).expect("spawn serializer");

        serializer.shutdown(42);

        let err = serializer.exec(|_| ()).expect_err("should be closed");
        assert_eq!(err.status, 42);
    }
}
