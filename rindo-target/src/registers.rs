//! レジスタアクセス機能

use nix::libc::user_regs_struct;

/// スレッドのレジスタ一式（amd64）
///
/// レジスタの取得・設定はすべてシリアライザ経由で行われるため、
/// このラッパーは値として受け渡しされます。
#[derive(Debug, Clone, Copy)]
pub struct Registers(pub user_regs_struct);

impl Registers {
    /// すべて0のレジスタを作成する
    pub fn zeroed() -> Self {
        // user_regs_structはプレーンなCの構造体なのでゼロ初期化で有効
        Self(unsafe { std::mem::zeroed() })
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn pc(&self) -> u64 {
        self.0.rip
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&mut self, pc: u64) {
        self.0.rip = pc;
    }

    /// スタックポインタ（RSP）を取得する
    pub fn sp(&self) -> u64 {
        self.0.rsp
    }

    /// ベースポインタ（RBP）を取得する
    pub fn bp(&self) -> u64 {
        self.0.rbp
    }

    /// スレッドローカルストレージのベースアドレス（FS base）を取得する
    pub fn tls(&self) -> u64 {
        self.0.fs_base
    }

    /// 表示用に主要なレジスタの名前と値の一覧を返す
    pub fn dump(&self) -> Vec<(&'static str, u64)> {
        let r = &self.0;
        vec![
            ("rip", r.rip),
            ("rsp", r.rsp),
            ("rbp", r.rbp),
            ("rax", r.rax),
            ("rbx", r.rbx),
            ("rcx", r.rcx),
            ("rdx", r.rdx),
            ("rsi", r.rsi),
            ("rdi", r.rdi),
            ("r8", r.r8),
            ("r9", r.r9),
            ("r10", r.r10),
            ("r11", r.r11),
            ("r12", r.r12),
            ("r13", r.r13),
            ("r14", r.r14),
            ("r15", r.r15),
            ("eflags", r.eflags),
            ("fs_base", r.fs_base),
            ("gs_base", r.gs_base),
        ]
    }
}
