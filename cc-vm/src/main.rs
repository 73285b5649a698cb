use std::collections::HashMap;
use std::io;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::info;
use vm::{
    DEFAULT_POOLSIZE, Debugger, Machine, RunOutcome, VmError, assemble, parse_instruction,
    render_vm_error,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    poolsize: usize,
    trace: bool,
    disasm: bool,
    debug: bool,
    repl: bool,
    help: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            source: None,
            poolsize: DEFAULT_POOLSIZE,
            trace: false,
            disasm: false,
            debug: false,
            repl: false,
            help: false,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    vm::logging::init()?;

    let Some(source_path) = cli.source.as_deref() else {
        return run_repl(&cli);
    };
    if cli.repl {
        return Err(io::Error::other("--repl does not take a source path").into());
    }

    let source = std::fs::read_to_string(source_path)?;
    let program = assemble(&source)?;
    let mut machine = Machine::new(cli.poolsize)?;
    let loaded = program.load(&mut machine)?;
    info!(
        path = source_path,
        cells = machine.op_counter(),
        symbols = loaded.symbols.len(),
        "program loaded"
    );

    if cli.disasm {
        print!("{}", machine.disassemble());
        return Ok(());
    }

    let outcome = if cli.debug {
        let mut debugger = Debugger::new();
        debugger.stop_on_entry();
        machine.run_with_debugger(&mut debugger, cli.trace)
    } else {
        machine.run(cli.trace)
    };
    match outcome {
        Ok(code) => {
            println!("exit({code}) cycle = {}", machine.cycle());
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", render_vm_error(&machine, &err));
            std::process::exit(1);
        }
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--trace" => {
                cfg.trace = true;
                index += 1;
            }
            "--disasm" => {
                cfg.disasm = true;
                index += 1;
            }
            "--debug" => {
                cfg.debug = true;
                index += 1;
            }
            "--repl" => {
                cfg.repl = true;
                index += 1;
            }
            "--poolsize" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --poolsize".to_string())?;
                cfg.poolsize = raw
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --poolsize value '{raw}'"))?;
                index += 2;
            }
            value if value.starts_with('-') => {
                return Err(format!("unknown flag '{value}'"));
            }
            path => {
                if cfg.source.is_some() {
                    return Err("multiple source paths provided".to_string());
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }

    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  cc-vm                      (defaults to REPL)");
    println!("  cc-vm --repl [--trace] [--poolsize <bytes>]");
    println!("  cc-vm [--trace] [--poolsize <bytes>] <source.asm>");
    println!("  cc-vm --disasm <source.asm>");
    println!("  cc-vm --debug <source.asm>");
}

fn run_repl(cli: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("cc-vm REPL");
    println!("one instruction (or a bare operand cell) per line, commands: .help, .quit");
    let mut editor = DefaultEditor::new()?;
    let mut machine = Machine::new(cli.poolsize)?;
    loop {
        match editor.readline("cc-vm> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if let Some(action) = handle_repl_command(line, &mut machine) {
                    if action == ReplAction::Break {
                        break;
                    }
                    continue;
                }
                match feed_repl_line(&mut machine, line, cli.trace) {
                    Ok(outcome) => report_batch(&machine, outcome),
                    Err(message) => println!("{message}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("bye");
                break;
            }
            Err(err) => {
                return Err(Box::new(io::Error::other(err.to_string())));
            }
        }
    }
    Ok(())
}

/// Commits one REPL line and runs whatever is complete. Operands are
/// numeric; the REPL keeps no symbol table.
fn feed_repl_line(
    machine: &mut Machine,
    line: &str,
    trace: bool,
) -> Result<Result<RunOutcome, VmError>, String> {
    let cells = parse_instruction(line, &HashMap::new()).map_err(|err| err.to_string())?;
    machine.append_all(&cells).map_err(|err| err.to_string())?;
    Ok(machine.run_available(trace))
}

fn report_batch(machine: &Machine, outcome: Result<RunOutcome, VmError>) {
    match outcome {
        Ok(RunOutcome::Exited(code)) => {
            println!("exit({code}) cycle = {}", machine.cycle());
        }
        Ok(RunOutcome::Pending) => {}
        Err(err) => println!("{}", render_vm_error(machine, &err)),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Break,
}

fn handle_repl_command(line: &str, machine: &mut Machine) -> Option<ReplAction> {
    match line {
        ".quit" | ".exit" => Some(ReplAction::Break),
        ".dis" => {
            print!("{}", machine.disassemble());
            Some(ReplAction::Continue)
        }
        ".regs" => {
            let regs = machine.registers();
            println!(
                "pc {} sp 0x{:x} bp 0x{:x} ax {} cycle {} status {:?}",
                machine.program_counter_offset(),
                regs.sp as u64,
                regs.bp as u64,
                regs.ax,
                regs.cycle,
                machine.status()
            );
            Some(ReplAction::Continue)
        }
        ".reset" => {
            machine.reset();
            println!("machine reset");
            Some(ReplAction::Continue)
        }
        ".help" => {
            println!("commands:");
            println!("  .dis       disassemble committed code");
            println!("  .regs      show registers and status");
            println!("  .reset     clear memory and registers");
            println!("  .help      show commands");
            println!("  .quit      quit repl");
            Some(ReplAction::Continue)
        }
        _ if line.starts_with('.') => {
            println!("unknown command: {line}");
            Some(ReplAction::Continue)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{feed_repl_line, parse_cli_args};
    use vm::{DEFAULT_POOLSIZE, Machine, RunOutcome};

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[test]
    fn parse_cli_defaults() {
        let cfg = parse_cli_args(&[]).expect("parse should succeed");
        assert_eq!(cfg.poolsize, DEFAULT_POOLSIZE);
        assert!(!cfg.trace);
        assert!(!cfg.disasm);
        assert!(!cfg.debug);
        assert!(!cfg.repl);
        assert!(cfg.source.is_none());
    }

    #[test]
    fn parse_cli_flags_with_source() {
        let cfg = parse_cli_args(&[
            s("--poolsize"),
            s("4096"),
            s("--trace"),
            s("demos/sum.asm"),
        ])
        .expect("parse should succeed");
        assert_eq!(cfg.poolsize, 4096);
        assert!(cfg.trace);
        assert_eq!(cfg.source.as_deref(), Some("demos/sum.asm"));
    }

    #[test]
    fn parse_cli_rejects_bad_poolsize() {
        let err = parse_cli_args(&[s("--poolsize"), s("lots")]).expect_err("parse should fail");
        assert!(err.contains("invalid --poolsize"));
        let err = parse_cli_args(&[s("--poolsize")]).expect_err("parse should fail");
        assert!(err.contains("missing value"));
    }

    #[test]
    fn parse_cli_rejects_multiple_sources_and_unknown_flags() {
        let err = parse_cli_args(&[s("a.asm"), s("b.asm")]).expect_err("parse should fail");
        assert!(err.contains("multiple source paths"));
        let err = parse_cli_args(&[s("--jit")]).expect_err("parse should fail");
        assert!(err.contains("unknown flag"));
    }

    #[test]
    fn repl_lines_commit_cells_and_run_when_complete() {
        let mut machine = Machine::new(1024).expect("allocate");
        assert_eq!(feed_repl_line(&mut machine, "IMM", false), Ok(Ok(RunOutcome::Pending)));
        assert_eq!(feed_repl_line(&mut machine, "7", false), Ok(Ok(RunOutcome::Pending)));
        assert_eq!(machine.ax(), 7);
        assert_eq!(feed_repl_line(&mut machine, "PUSH", false), Ok(Ok(RunOutcome::Pending)));
        assert_eq!(
            feed_repl_line(&mut machine, "EXIT", false),
            Ok(Ok(RunOutcome::Exited(7)))
        );
    }

    #[test]
    fn repl_lines_reject_named_operands() {
        let mut machine = Machine::new(1024).expect("allocate");
        let err = feed_repl_line(&mut machine, "JMP top", false).expect_err("no symbols");
        assert!(err.contains("unknown label or symbol 'top'"));
        assert_eq!(machine.op_counter(), 0);
    }
}
