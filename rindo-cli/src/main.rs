//! Rindo CLI - コマンドラインインターフェース
//!
//! GoバイナリのデバッガrindoのREPLインターフェース

mod command;

use anyhow::Result;
use clap::{Parser, Subcommand};
use command::{parse_address, Command};
use rindo_core::{DebugError, GStatus, Process};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

/// Rindo - Go Debugger
#[derive(Parser)]
#[command(name = "rindo")]
#[command(version = "0.1.0")]
#[command(about = "Source-level debugger for Go binaries", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    // 環境変数 RUST_LOG でログレベルを制御可能 (例: RUST_LOG=debug rindo run ./binary)
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    println!("Rindo - Go Debugger");
    println!();

    let cli = Cli::parse();
    let mut process = init_process(cli.command)?;
    run_repl(&mut process)?;

    Ok(())
}

/// デバッグ対象のプロセスを起動またはアタッチする
fn init_process(command: DebugCommand) -> Result<Process> {
    match command {
        DebugCommand::Run { binary, args } => {
            println!("Launching binary: {}", binary);
            let process = Process::launch(&binary, &args)?;
            println!("Process {} launched and stopped", process.pid);
            println!();
            Ok(process)
        }
        DebugCommand::Attach { pid } => {
            println!("Attaching to process: {}", pid);
            let process = Process::attach(pid)?;
            println!("Attached to process {}", pid);
            println!();
            Ok(process)
        }
    }
}

/// REPLループを実行する
fn run_repl(process: &mut Process) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(rindo) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => {
                        if let Err(e) = process.detach(false) {
                            eprintln!("Warning: detach failed: {}", e);
                        }
                        println!("Goodbye!");
                        return Ok(());
                    }
                    Some(cmd) => {
                        if let Err(e) = handle_command(process, cmd) {
                            println!("Error: {}", e);
                            if matches!(e, DebugError::ProcessExited { .. }) {
                                return Ok(());
                            }
                        }
                    }
                    None => println!("Unknown command: {} (try 'help')", line),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn handle_command(process: &mut Process, cmd: Command) -> rindo_core::Result<()> {
    match cmd {
        Command::Break(loc) => handle_break(process, &loc),
        Command::Clear(loc) => handle_clear(process, &loc),
        Command::Breakpoints => {
            handle_breakpoints(process);
            Ok(())
        }
        Command::Continue => handle_continue(process),
        Command::Next => {
            process.next()?;
            print_stop_location(process);
            Ok(())
        }
        Command::Step => {
            process.step()?;
            print_stop_location(process);
            Ok(())
        }
        Command::Threads => {
            handle_threads(process);
            Ok(())
        }
        Command::Thread(tid) => {
            process.switch_thread(tid)?;
            println!("Switched to thread {}", tid);
            Ok(())
        }
        Command::Goroutines => handle_goroutines(process),
        Command::Goroutine(gid) => {
            process.switch_goroutine(gid)?;
            if let Some(g) = process.selected_goroutine() {
                println!("Switched to goroutine {}", g.id);
            }
            Ok(())
        }
        Command::Registers => {
            let regs = process.registers()?;
            for (name, value) in regs.dump() {
                println!("{:>8} = 0x{:016x}", name, value);
            }
            Ok(())
        }
        Command::Backtrace => handle_backtrace(process),
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Quit => Ok(()),
    }
}

/// 位置指定（アドレス / ファイル:行 / 関数名）をアドレスに解決する
fn resolve_location(process: &Process, loc: &str) -> rindo_core::Result<u64> {
    if let Some(addr) = parse_address(loc) {
        return Ok(addr);
    }
    if let Some((file, line)) = loc.rsplit_once(':') {
        if let Ok(line) = line.parse::<u64>() {
            return process.find_file_location(file, line);
        }
    }
    process.find_function_location(loc, true, 0)
}

fn handle_break(process: &mut Process, loc: &str) -> rindo_core::Result<()> {
    let addr = resolve_location(process, loc)?;
    let bp = process.set_breakpoint(addr)?;
    let (id, addr) = (bp.id, bp.addr);
    println!("Breakpoint {} set at 0x{:x}", id, addr);
    if let Some((file, line)) = process.pc_to_line(addr) {
        println!("  ({}:{})", file, line);
    }
    Ok(())
}

fn handle_clear(process: &mut Process, loc: &str) -> rindo_core::Result<()> {
    let addr = resolve_location(process, loc)?;
    let bp = process.clear_breakpoint(addr)?;
    println!("Breakpoint {} cleared at 0x{:x}", bp.id, bp.addr);
    Ok(())
}

fn handle_breakpoints(process: &Process) {
    let mut bps: Vec<_> = process
        .breakpoints()
        .values()
        .filter(|bp| !bp.temp)
        .collect();
    bps.sort_by_key(|bp| bp.id);
    if bps.is_empty() {
        println!("No breakpoints set");
        return;
    }
    for bp in bps {
        print!("Breakpoint {} at 0x{:x}", bp.id, bp.addr);
        if let Some((file, line)) = process.pc_to_line(bp.addr) {
            print!(" {}:{}", file, line);
        }
        println!();
    }
}

fn handle_continue(process: &mut Process) -> rindo_core::Result<()> {
    println!("Continuing execution...");
    process.continue_execution()?;

    if let Some(bp) = process.current_breakpoint() {
        println!("Breakpoint {} hit", bp.id);
    }
    print_stop_location(process);
    Ok(())
}

fn handle_threads(process: &Process) {
    let current = process.current_thread().map(|t| t.id).unwrap_or(-1);
    for thread in process.threads() {
        let marker = if thread.id == current { "*" } else { " " };
        match thread.pc() {
            Ok(pc) => println!("{} thread {} at 0x{:x}", marker, thread.id, pc),
            Err(_) => println!("{} thread {} (running)", marker, thread.id),
        }
    }
}

fn handle_goroutines(process: &mut Process) -> rindo_core::Result<()> {
    let selected = process.selected_goroutine().map(|g| g.id);
    let goroutines = process.goroutines_info()?;
    println!("{} goroutines:", goroutines.len());
    for g in goroutines {
        let marker = if Some(g.id) == selected { "*" } else { " " };
        let status = match g.status {
            GStatus::Running => "running",
            GStatus::Runnable => "runnable",
            GStatus::Waiting => "waiting",
            GStatus::Syscall => "syscall",
            _ => "other",
        };
        print!("{} goroutine {} [{}]", marker, g.id, status);
        if let (Some(file), Some(line)) = (&g.current_loc.file, g.current_loc.line) {
            print!(" {}:{}", file, line);
        }
        if let Some(func) = &g.current_loc.function {
            print!(" in {}", func);
        }
        if !g.wait_reason.is_empty() {
            print!(" ({})", g.wait_reason);
        }
        println!();
    }
    Ok(())
}

fn handle_backtrace(process: &mut Process) -> rindo_core::Result<()> {
    let g = match process.selected_goroutine().cloned() {
        Some(g) => g,
        None => {
            println!("No goroutine selected");
            return Ok(());
        }
    };
    let frames = process.goroutine_stacktrace(&g, 32)?;
    for (i, frame) in frames.iter().enumerate() {
        print!("#{:<3} 0x{:016x}", i, frame.pc);
        if let Some(func) = &frame.function {
            print!(" in {}", func);
        }
        if let (Some(file), Some(line)) = (&frame.file, frame.line) {
            print!(" at {}:{}", file, line);
        }
        println!();
    }
    Ok(())
}

/// 停止位置を表示する
fn print_stop_location(process: &Process) {
    let Ok(pc) = process.pc() else {
        return;
    };
    print!("Stopped at 0x{:x}", pc);
    if let Some((file, line)) = process.pc_to_line(pc) {
        print!(" ({}:{})", file, line);
    }
    println!();
}

fn print_help() {
    println!("Available commands:");
    println!("  break <loc>  (b)   Set breakpoint at address, file:line or function");
    println!("  clear <loc>        Clear breakpoint");
    println!("  breakpoints  (bp)  List breakpoints");
    println!("  continue     (c)   Continue execution");
    println!("  next         (n)   Step over to the next source line");
    println!("  step         (s)   Step a single instruction");
    println!("  threads            List threads");
    println!("  thread <id>  (t)   Switch current thread");
    println!("  goroutines   (gs)  List goroutines");
    println!("  goroutine <id> (g) Switch selected goroutine");
    println!("  regs               Show registers");
    println!("  backtrace    (bt)  Show stacktrace of the selected goroutine");
    println!("  help         (h)   Show this help");
    println!("  quit         (q)   Detach and exit");
}
