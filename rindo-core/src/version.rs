//! ランタイムのバージョン文字列の解析

/// リリース段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Beta(u64),
    Rc(u64),
    Release,
}

/// Goランタイムのバージョン
///
/// トレース対象から読み取ったruntime.buildVersionを解析した結果。
/// 開発版（devel）はどのリリースよりも新しいものとして扱います。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoVersion {
    devel: bool,
    major: u64,
    minor: u64,
    rev: u64,
    stage_beta: u64,
    stage_rc: u64,
}

impl GoVersion {
    /// リリース版のバージョンを作る
    pub fn new(major: u64, minor: u64) -> Self {
        Self {
            devel: false,
            major,
            minor,
            rev: 0,
            stage_beta: 0,
            stage_rc: 0,
        }
    }

    /// "go1.5.1" / "go1.5beta1" / "devel +..." 形式を解析する
    pub fn parse(s: &str) -> Option<GoVersion> {
        let s = s.trim();
        if s.starts_with("devel") {
            return Some(GoVersion {
                devel: true,
                major: 0,
                minor: 0,
                rev: 0,
                stage_beta: 0,
                stage_rc: 0,
            });
        }

        let rest = s.strip_prefix("go")?;

        // beta/rc接尾辞を切り離す
        let (numbers, stage_beta, stage_rc) = if let Some(idx) = rest.find("beta") {
            let n: u64 = rest[idx + 4..].parse().ok()?;
            (&rest[..idx], n, 0)
        } else if let Some(idx) = rest.find("rc") {
            let n: u64 = rest[idx + 2..].parse().ok()?;
            (&rest[..idx], 0, n)
        } else {
            (rest, 0, 0)
        };

        let mut parts = numbers.split('.');
        let major: u64 = parts.next()?.parse().ok()?;
        let minor: u64 = parts.next()?.parse().ok()?;
        let rev: u64 = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(GoVersion {
            devel: false,
            major,
            minor,
            rev,
            stage_beta,
            stage_rc,
        })
    }

    /// 開発版かどうか
    pub fn is_devel(&self) -> bool {
        self.devel
    }

    fn stage(&self) -> Stage {
        if self.stage_beta > 0 {
            Stage::Beta(self.stage_beta)
        } else if self.stage_rc > 0 {
            Stage::Rc(self.stage_rc)
        } else {
            Stage::Release
        }
    }

    /// このバージョンが指定バージョン以降かどうか
    pub fn after_or_equal(&self, other: &GoVersion) -> bool {
        if self.devel {
            return true;
        }
        if other.devel {
            return false;
        }
        (self.major, self.minor, self.rev, self.stage())
            >= (other.major, other.minor, other.rev, other.stage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        let v = GoVersion::parse("go1.5").expect("go1.5");
        assert_eq!((v.major, v.minor, v.rev), (1, 5, 0));
        let v = GoVersion::parse("go1.4.2").expect("go1.4.2");
        assert_eq!((v.major, v.minor, v.rev), (1, 4, 2));
    }

    #[test]
    fn test_parse_prerelease() {
        let beta = GoVersion::parse("go1.5beta1").expect("beta");
        let rc = GoVersion::parse("go1.5rc2").expect("rc");
        let release = GoVersion::parse("go1.5").expect("release");
        assert!(rc.after_or_equal(&beta));
        assert!(release.after_or_equal(&rc));
        assert!(!beta.after_or_equal(&release));
    }

    #[test]
    fn test_parse_devel() {
        let v = GoVersion::parse("devel +a1b2c3 Mon Jan 1").expect("devel");
        assert!(v.is_devel());
        assert!(v.after_or_equal(&GoVersion::new(1, 5)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(GoVersion::parse("").is_none());
        assert!(GoVersion::parse("go").is_none());
        assert!(GoVersion::parse("gox.y").is_none());
    }

    #[test]
    fn test_ordering() {
        let v14 = GoVersion::parse("go1.4.2").expect("1.4.2");
        let v15 = GoVersion::parse("go1.5").expect("1.5");
        assert!(v15.after_or_equal(&v14));
        assert!(!v14.after_or_equal(&v15));
        assert!(v15.after_or_equal(&GoVersion::new(1, 5)));
    }
}
