use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};

use crate::disasm;
use crate::vm::{Address, Machine, WORD_SIZE, Word};

const DEFAULT_LISTING: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepMode {
    Running,
    Step,
}

/// Breakpoints on code cell offsets plus an interactive prompt, consulted by
/// [`Machine::run_with_debugger`] before every instruction.
pub struct Debugger {
    breakpoints: BTreeSet<usize>,
    step_mode: StepMode,
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl Debugger {
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeSet::new(),
            step_mode: StepMode::Running,
        }
    }

    pub fn stop_on_entry(&mut self) {
        self.step_mode = StepMode::Step;
    }

    pub fn add_breakpoint(&mut self, offset: usize) {
        self.breakpoints.insert(offset);
    }

    pub fn remove_breakpoint(&mut self, offset: usize) {
        self.breakpoints.remove(&offset);
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    /// Whether the instruction at the machine's `pc` should stop execution.
    pub fn should_break(&self, vm: &Machine) -> bool {
        self.step_mode == StepMode::Step
            || self.breakpoints.contains(&vm.program_counter_offset())
    }

    pub fn on_instruction(&mut self, vm: &Machine) {
        if self.should_break(vm) {
            self.step_mode = StepMode::Running;
            let stdin = io::stdin();
            self.repl(vm, &mut stdin.lock(), &mut io::stdout());
        }
    }

    /// Reads commands until one resumes execution or input ends.
    pub fn repl(&mut self, vm: &Machine, input: &mut dyn BufRead, out: &mut dyn Write) {
        let _ = writeln!(out, "stopped at {}", current_instruction(vm));
        let mut line = String::new();
        loop {
            let _ = write!(out, "(vmdb) ");
            let _ = out.flush();
            line.clear();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if handle_command(&line, vm, &mut self.breakpoints, &mut self.step_mode, out)
                .is_break()
            {
                break;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReplAction {
    Continue,
    Break,
}

impl ReplAction {
    fn is_break(self) -> bool {
        matches!(self, ReplAction::Break)
    }
}

fn handle_command(
    line: &str,
    vm: &Machine,
    breakpoints: &mut BTreeSet<usize>,
    step: &mut StepMode,
    out: &mut dyn Write,
) -> ReplAction {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return ReplAction::Continue;
    };
    match cmd {
        "c" | "continue" => return ReplAction::Break,
        "s" | "step" | "stepi" => {
            *step = StepMode::Step;
            return ReplAction::Break;
        }
        "b" | "break" => match parse_usize(parts.next()) {
            Some(offset) => {
                breakpoints.insert(offset);
                let _ = writeln!(out, "breakpoint set at {offset}");
            }
            None => {
                let _ = writeln!(out, "usage: break <cell>");
            }
        },
        "clear" => match parse_usize(parts.next()) {
            Some(offset) => {
                breakpoints.remove(&offset);
                let _ = writeln!(out, "breakpoint cleared at {offset}");
            }
            None => {
                let _ = writeln!(out, "usage: clear <cell>");
            }
        },
        "breaks" => {
            let _ = writeln!(out, "breakpoints: {:?}", breakpoints);
        }
        "regs" => {
            let regs = vm.registers();
            let _ = writeln!(
                out,
                "pc {} bp {} sp {} ax {} cycle {}",
                vm.program_counter_offset(),
                describe_stack_slot(regs.bp),
                describe_stack_slot(regs.sp),
                regs.ax,
                regs.cycle
            );
        }
        "stack" => {
            let count = parse_usize(parts.next()).unwrap_or(8);
            let _ = writeln!(out, "stack: {:?}", vm.stack_words(count));
        }
        "dis" => {
            let count = parse_usize(parts.next()).unwrap_or(DEFAULT_LISTING);
            let cells = vm.code_cells();
            let start = vm.program_counter_offset();
            let end = start.saturating_add(count.saturating_mul(2));
            let listing = disasm::disassemble_range(&cells, start, end);
            for text in listing.lines().take(count) {
                let _ = writeln!(out, "{text}");
            }
        }
        "pc" => {
            let _ = writeln!(out, "pc: {}", vm.program_counter_offset());
        }
        "help" => {
            let _ = writeln!(
                out,
                "commands: break, clear, breaks, continue, step, regs, stack [n], dis [n], pc, help"
            );
        }
        _ => {
            let _ = writeln!(out, "unknown command");
        }
    }
    ReplAction::Continue
}

fn current_instruction(vm: &Machine) -> String {
    let cells = vm.code_cells();
    let start = vm.program_counter_offset();
    disasm::disassemble_range(&cells, start, start + 1)
        .lines()
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{start:04}: <end of code>"))
}

fn describe_stack_slot(address: Word) -> String {
    match Address::decode(address) {
        Address::Stack(offset) => format!("stack+{}", offset / WORD_SIZE),
        _ => format!("0x{:x}", address as u64),
    }
}

fn parse_usize(token: Option<&str>) -> Option<usize> {
    token.and_then(|value| value.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Cursor;

    use crate::vm::{Machine, OpCode, Word};

    use super::{Debugger, ReplAction, StepMode, handle_command};

    fn machine() -> Machine {
        let mut vm = Machine::new(1024).expect("allocate");
        vm.append_all(&[
            OpCode::Imm as Word,
            4,
            OpCode::Push as Word,
            OpCode::Exit as Word,
        ])
        .expect("fits");
        vm
    }

    fn run_command(line: &str, vm: &Machine) -> (ReplAction, String, BTreeSet<usize>, StepMode) {
        let mut out = Vec::<u8>::new();
        let mut breakpoints = BTreeSet::new();
        let mut step = StepMode::Running;
        let action = handle_command(line, vm, &mut breakpoints, &mut step, &mut out);
        let text = String::from_utf8(out).expect("output should be utf-8");
        (action, text, breakpoints, step)
    }

    #[test]
    fn break_and_step_update_state() {
        let vm = machine();
        let (action, text, breakpoints, _) = run_command("break 2", &vm);
        assert_eq!(action, ReplAction::Continue);
        assert!(text.contains("breakpoint set at 2"));
        assert!(breakpoints.contains(&2));

        let (action, _, _, step) = run_command("s", &vm);
        assert_eq!(action, ReplAction::Break);
        assert_eq!(step, StepMode::Step);
    }

    #[test]
    fn dis_lists_from_pc() {
        let vm = machine();
        let (_, text, _, _) = run_command("dis 2", &vm);
        assert_eq!(text, "0000: IMM  4\n0002: PUSH\n");
    }

    #[test]
    fn dis_with_a_huge_count_lists_to_the_end() {
        let vm = machine();
        let (_, text, _, _) = run_command(&format!("dis {}", usize::MAX), &vm);
        assert_eq!(text, "0000: IMM  4\n0002: PUSH\n0003: EXIT\n");
    }

    #[test]
    fn regs_and_unknown_commands() {
        let vm = machine();
        let (_, text, _, _) = run_command("regs", &vm);
        assert_eq!(text, "pc 0 bp stack+128 sp stack+128 ax 0 cycle 0\n");
        let (_, text, _, _) = run_command("frobnicate", &vm);
        assert_eq!(text, "unknown command\n");
    }

    #[test]
    fn breakpoints_stop_before_the_instruction() {
        let mut vm = machine();
        let mut debugger = Debugger::new();
        debugger.add_breakpoint(2);
        assert!(!debugger.should_break(&vm));
        vm.step(false);
        assert!(debugger.should_break(&vm));
        debugger.remove_breakpoint(2);
        assert!(!debugger.should_break(&vm));
    }

    #[test]
    fn repl_reads_until_resume() {
        let mut vm = machine();
        vm.step(false);
        let mut debugger = Debugger::new();
        let mut input = Cursor::new(b"pc\nstack 1\ncontinue\nregs\n".to_vec());
        let mut out = Vec::<u8>::new();
        debugger.repl(&vm, &mut input, &mut out);
        let text = String::from_utf8(out).expect("output should be utf-8");
        assert!(text.starts_with("stopped at 0002: PUSH\n"));
        assert!(text.contains("pc: 2\n"));
        assert!(text.contains("stack: []\n"));
        assert!(!text.contains("cycle"));
    }
}
