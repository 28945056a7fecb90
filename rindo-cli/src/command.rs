//! デバッガコマンド

/// REPLで受け付けるデバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ブレークポイントを設定
    Break(String),
    /// ブレークポイントを削除
    Clear(String),
    /// ブレークポイント一覧表示
    Breakpoints,
    /// 実行継続
    Continue,
    /// 次の行へ（ステップオーバー）
    Next,
    /// 1命令ステップ実行
    Step,
    /// スレッド一覧表示
    Threads,
    /// カレントスレッドの切り替え
    Thread(i32),
    /// ゴルーチン一覧表示
    Goroutines,
    /// ゴルーチンの切り替え
    Goroutine(i64),
    /// レジスタ表示
    Registers,
    /// バックトレース表示
    Backtrace,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.trim().split_whitespace().collect();
        if parts.is_empty() {
            return None;
        }

        match parts[0] {
            "break" | "b" => {
                if parts.len() > 1 {
                    Some(Command::Break(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "clear" => {
                if parts.len() > 1 {
                    Some(Command::Clear(parts[1..].join(" ")))
                } else {
                    None
                }
            }
            "breakpoints" | "bp" => Some(Command::Breakpoints),
            "continue" | "c" => Some(Command::Continue),
            "next" | "n" => Some(Command::Next),
            "step" | "s" => Some(Command::Step),
            "threads" => Some(Command::Threads),
            "thread" | "t" => parts.get(1)?.parse().ok().map(Command::Thread),
            "goroutines" | "gs" => Some(Command::Goroutines),
            "goroutine" | "g" => parts.get(1)?.parse().ok().map(Command::Goroutine),
            "regs" | "registers" => Some(Command::Registers),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// アドレス表記（16進または10進）をパースする
pub fn parse_address(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("next"), Some(Command::Next));
        assert_eq!(
            Command::parse("break main.main"),
            Some(Command::Break("main.main".to_string()))
        );
        assert_eq!(Command::parse("thread 42"), Some(Command::Thread(42)));
        assert_eq!(Command::parse("goroutine 7"), Some(Command::Goroutine(7)));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse("break"), None);
        assert_eq!(Command::parse("nosuch"), None);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x400abc"), Some(0x400abc));
        assert_eq!(parse_address("1024"), Some(1024));
        assert_eq!(parse_address("main.main"), None);
    }
}
