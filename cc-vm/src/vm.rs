use tracing::{debug, error, info, warn};

mod diagnostics;
mod host;
mod memory;
mod printf;

pub use diagnostics::render_vm_error;
pub use host::{Host, HostHeap, SystemHost};
pub use memory::{Address, MemoryError, Segment, SegmentKind, WORD_SIZE, Word};
pub use printf::MAX_VALUES as PRTF_MAX_VALUES;

use memory::Memory;

/// Pool size used by the command line runner and by most tests: 256 KiB per
/// segment.
pub const DEFAULT_POOLSIZE: usize = 256 * 1024;

/// Cells `setup_entry` appends after the program: `ADJ 2, PUSH, EXIT`.
pub const ENTRY_STUB_CELLS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum OpCode {
    Lea = 0,
    Imm = 1,
    Jmp = 2,
    Call = 3,
    Jz = 4,
    Jnz = 5,
    Ent = 6,
    Adj = 7,
    Lev = 8,
    Li = 9,
    Lc = 10,
    Si = 11,
    Sc = 12,
    Push = 13,
    Or = 14,
    Xor = 15,
    And = 16,
    Eq = 17,
    Ne = 18,
    Lt = 19,
    Gt = 20,
    Le = 21,
    Ge = 22,
    Shl = 23,
    Shr = 24,
    Add = 25,
    Sub = 26,
    Mul = 27,
    Div = 28,
    Mod = 29,
    Open = 30,
    Read = 31,
    Clos = 32,
    Prtf = 33,
    Malc = 34,
    Free = 35,
    Mset = 36,
    Mcmp = 37,
    Exit = 38,
}

impl OpCode {
    pub const ALL: [OpCode; 39] = [
        OpCode::Lea,
        OpCode::Imm,
        OpCode::Jmp,
        OpCode::Call,
        OpCode::Jz,
        OpCode::Jnz,
        OpCode::Ent,
        OpCode::Adj,
        OpCode::Lev,
        OpCode::Li,
        OpCode::Lc,
        OpCode::Si,
        OpCode::Sc,
        OpCode::Push,
        OpCode::Or,
        OpCode::Xor,
        OpCode::And,
        OpCode::Eq,
        OpCode::Ne,
        OpCode::Lt,
        OpCode::Gt,
        OpCode::Le,
        OpCode::Ge,
        OpCode::Shl,
        OpCode::Shr,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Open,
        OpCode::Read,
        OpCode::Clos,
        OpCode::Prtf,
        OpCode::Malc,
        OpCode::Free,
        OpCode::Mset,
        OpCode::Mcmp,
        OpCode::Exit,
    ];

    pub fn from_word(word: Word) -> Option<Self> {
        usize::try_from(word)
            .ok()
            .and_then(|index| Self::ALL.get(index).copied())
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Lea => "LEA",
            OpCode::Imm => "IMM",
            OpCode::Jmp => "JMP",
            OpCode::Call => "CALL",
            OpCode::Jz => "JZ",
            OpCode::Jnz => "JNZ",
            OpCode::Ent => "ENT",
            OpCode::Adj => "ADJ",
            OpCode::Lev => "LEV",
            OpCode::Li => "LI",
            OpCode::Lc => "LC",
            OpCode::Si => "SI",
            OpCode::Sc => "SC",
            OpCode::Push => "PUSH",
            OpCode::Or => "OR",
            OpCode::Xor => "XOR",
            OpCode::And => "AND",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Lt => "LT",
            OpCode::Gt => "GT",
            OpCode::Le => "LE",
            OpCode::Ge => "GE",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Open => "OPEN",
            OpCode::Read => "READ",
            OpCode::Clos => "CLOS",
            OpCode::Prtf => "PRTF",
            OpCode::Malc => "MALC",
            OpCode::Free => "FREE",
            OpCode::Mset => "MSET",
            OpCode::Mcmp => "MCMP",
            OpCode::Exit => "EXIT",
        }
    }

    /// Case-insensitive inverse of [`OpCode::mnemonic`].
    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|opcode| opcode.mnemonic().eq_ignore_ascii_case(op))
    }

    /// Every opcode up to and including `ADJ` carries one operand cell.
    pub fn has_operand(self) -> bool {
        self as Word <= OpCode::Adj as Word
    }

    /// Cells occupied by the instruction in the code segment.
    pub fn width(self) -> usize {
        if self.has_operand() { 2 } else { 1 }
    }

    /// Cells that must be committed before the instruction may execute.
    ///
    /// `PRTF` locates its arguments through the operand of the `ADJ` that
    /// follows it, so the whole `PRTF, ADJ, k` triple has to be present.
    pub fn lookahead(self) -> usize {
        match self {
            OpCode::Prtf => 1 + OpCode::Adj.width(),
            other => other.width(),
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            OpCode::Jmp | OpCode::Call | OpCode::Jz | OpCode::Jnz
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    Memory(MemoryError),
    OpCounterOverflow { capacity: usize },
    DataOverflow { requested: usize, available: usize },
    UnknownOpcode(Word),
    PcOutOfBounds { pc: usize, op_counter: usize },
    StackOverflow,
    StackUnderflow,
    SegmentFault { address: Word, width: usize },
    SegmentMismatch { expected: &'static str, address: Word },
    UnalignedCode(Word),
    DivisionByZero,
    MalformedHostCall(&'static str),
    UnresolvedSymbol(String),
    HostError(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Memory(err) => write!(f, "memory error: {err}"),
            VmError::OpCounterOverflow { capacity } => {
                write!(f, "op counter overflow: code segment holds {capacity} cells")
            }
            VmError::DataOverflow {
                requested,
                available,
            } => write!(
                f,
                "data segment overflow: {requested} bytes requested, {available} available"
            ),
            VmError::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            VmError::PcOutOfBounds { pc, op_counter } => write!(
                f,
                "pc cell {pc} is outside the {op_counter} committed code cells"
            ),
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::SegmentFault { address, width } => {
                write!(f, "segment fault: {width} bytes at 0x{:x}", *address as u64)
            }
            VmError::SegmentMismatch { expected, address } => write!(
                f,
                "expected a {expected} address, got 0x{:x}",
                *address as u64
            ),
            VmError::UnalignedCode(address) => {
                write!(f, "unaligned code address 0x{:x}", *address as u64)
            }
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::MalformedHostCall(message) => write!(f, "malformed host call: {message}"),
            VmError::UnresolvedSymbol(name) => write!(f, "unresolved symbol '{name}'"),
            VmError::HostError(message) => write!(f, "host error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<MemoryError> for VmError {
    fn from(err: MemoryError) -> Self {
        VmError::Memory(err)
    }
}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Init,
    Running,
    Exit,
    Error,
}

/// How a [`Machine::run_available`] batch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(Word),
    /// The next instruction is not fully committed yet.
    Pending,
}

/// Register snapshot; `pc`, `bp` and `sp` are tagged addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registers {
    pub pc: Word,
    pub bp: Word,
    pub sp: Word,
    pub ax: Word,
    pub cycle: u64,
}

pub struct Machine {
    memory: Memory,
    host: Box<dyn Host>,
    poolsize: usize,
    pc: usize,
    instruction_pc: usize,
    bp: usize,
    sp: usize,
    ax: Word,
    cycle: u64,
    op_counter: usize,
    data_cursor: usize,
    status: Status,
    result: Word,
    fault: Option<VmError>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("poolsize", &self.poolsize)
            .field("registers", &self.registers())
            .field("op_counter", &self.op_counter)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub fn new(poolsize: usize) -> Result<Self, MemoryError> {
        Self::with_host(poolsize, Box::new(SystemHost))
    }

    pub fn with_host(poolsize: usize, host: Box<dyn Host>) -> Result<Self, MemoryError> {
        let memory = Memory::allocate(poolsize).inspect_err(|err| {
            error!(poolsize, %err, "vm allocation failed");
        })?;
        let stack_top = (poolsize / WORD_SIZE) * WORD_SIZE;
        debug!(poolsize, "vm segments allocated");
        Ok(Self {
            memory,
            host,
            poolsize,
            pc: 0,
            instruction_pc: 0,
            bp: stack_top,
            sp: stack_top,
            ax: 0,
            cycle: 0,
            op_counter: 0,
            data_cursor: 0,
            status: Status::Init,
            result: 0,
            fault: None,
        })
    }

    /// Zeroes all segments, frees host allocations and restores the initial
    /// registers. The segments themselves are reused.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.pc = 0;
        self.instruction_pc = 0;
        self.bp = self.stack_top();
        self.sp = self.stack_top();
        self.ax = 0;
        self.cycle = 0;
        self.op_counter = 0;
        self.data_cursor = 0;
        self.status = Status::Init;
        self.result = 0;
        self.fault = None;
        debug!(poolsize = self.poolsize, "vm reset");
    }

    pub fn poolsize(&self) -> usize {
        self.poolsize
    }

    /// Code capacity in cells.
    pub fn capacity(&self) -> usize {
        self.poolsize / WORD_SIZE
    }

    pub fn op_counter(&self) -> usize {
        self.op_counter
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Value reported by the last `EXIT`, `0` before one ran.
    pub fn result(&self) -> Word {
        self.result
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.fault.as_ref()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn ax(&self) -> Word {
        self.ax
    }

    pub fn registers(&self) -> Registers {
        Registers {
            pc: Address::Code(self.pc).encode(),
            bp: Address::Stack(self.bp).encode(),
            sp: Address::Stack(self.sp).encode(),
            ax: self.ax,
            cycle: self.cycle,
        }
    }

    /// One past the last stack cell: where `bp` and `sp` start.
    pub fn stack_top(&self) -> usize {
        self.capacity() * WORD_SIZE
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    pub fn base_pointer(&self) -> usize {
        self.bp
    }

    /// Index of the cell `pc` points at.
    pub fn program_counter_offset(&self) -> usize {
        self.pc / WORD_SIZE
    }

    /// Cell of the instruction executed most recently.
    pub fn last_instruction_offset(&self) -> usize {
        self.instruction_pc
    }

    /// The committed part of the code segment.
    pub fn code_cells(&self) -> Vec<Word> {
        (0..self.op_counter)
            .filter_map(|cell| self.memory.code.read_word(cell * WORD_SIZE).ok())
            .collect()
    }

    /// Up to `count` cells from the top of the stack, top first.
    pub fn stack_words(&self, count: usize) -> Vec<Word> {
        (0..count)
            .map(|index| self.sp + index * WORD_SIZE)
            .take_while(|offset| *offset < self.stack_top())
            .filter_map(|offset| self.memory.stack.read_word(offset).ok())
            .collect()
    }

    pub fn load_word(&self, address: Word) -> VmResult<Word> {
        self.memory.load_word(address)
    }

    pub fn load_bytes(&self, address: Word, len: usize) -> VmResult<&[u8]> {
        self.memory.bytes(address, len)
    }

    pub fn host_blocks(&self) -> usize {
        self.memory.heap.live_blocks()
    }

    pub fn host_mut(&mut self) -> &mut dyn Host {
        self.host.as_mut()
    }

    pub fn disassemble(&self) -> String {
        crate::disasm::disassemble(&self.code_cells())
    }

    /// Commits one cell to the code segment. On overflow the cell is dropped,
    /// the error is logged and the machine stays usable.
    pub fn append(&mut self, cell: Word) -> VmResult<()> {
        if self.op_counter >= self.capacity() {
            warn!(capacity = self.capacity(), cell, "op counter overflow, cell dropped");
            return Err(VmError::OpCounterOverflow {
                capacity: self.capacity(),
            });
        }
        self.memory
            .code
            .write_word(self.op_counter * WORD_SIZE, cell)?;
        self.op_counter += 1;
        Ok(())
    }

    /// Commits all cells or none of them.
    pub fn append_all(&mut self, cells: &[Word]) -> VmResult<()> {
        if self.op_counter + cells.len() > self.capacity() {
            warn!(
                capacity = self.capacity(),
                requested = cells.len(),
                "op counter overflow, cells dropped"
            );
            return Err(VmError::OpCounterOverflow {
                capacity: self.capacity(),
            });
        }
        for &cell in cells {
            self.append(cell)?;
        }
        Ok(())
    }

    pub fn put_constant(&mut self, value: Word) -> VmResult<Word> {
        self.put_bytes(&value.to_ne_bytes())
    }

    /// Copies raw bytes into the data segment and returns their address.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> VmResult<Word> {
        let available = self.memory.data.len() - self.data_cursor;
        if bytes.len() > available {
            warn!(requested = bytes.len(), available, "data segment overflow");
            return Err(VmError::DataOverflow {
                requested: bytes.len(),
                available,
            });
        }
        let address = Address::Data(self.data_cursor).encode();
        self.memory
            .data
            .bytes_mut(self.data_cursor, bytes.len())?
            .copy_from_slice(bytes);
        self.data_cursor += bytes.len();
        Ok(address)
    }

    /// Stores a NUL-terminated string and realigns the cursor to a word.
    pub fn put_string(&mut self, text: &str) -> VmResult<Word> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let address = self.put_bytes(&bytes)?;
        let aligned = self.data_cursor.div_ceil(WORD_SIZE) * WORD_SIZE;
        self.data_cursor = aligned.min(self.memory.data.len());
        Ok(address)
    }

    pub fn next_code_address(&self) -> Word {
        Address::Code(self.op_counter * WORD_SIZE).encode()
    }

    pub fn set_pc(&mut self, address: Word) -> VmResult<()> {
        self.pc = self.code_offset(address)?;
        Ok(())
    }

    /// Builds the outer frame a `main`-style routine returns through.
    ///
    /// Appends the stub `ADJ 2, PUSH, EXIT`, pushes `argc`, `argv` and the
    /// stub address as return address, then points `pc` at `entry`.
    pub fn setup_entry(&mut self, entry: Word, argc: Word, argv: Word) -> VmResult<()> {
        let entry = self.code_offset(entry)?;
        if self.sp < 3 * WORD_SIZE {
            return Err(VmError::StackOverflow);
        }
        let stub = self.next_code_address();
        let stub_cells: [Word; ENTRY_STUB_CELLS] = [
            OpCode::Adj as Word,
            2,
            OpCode::Push as Word,
            OpCode::Exit as Word,
        ];
        self.append_all(&stub_cells)?;
        self.push(argc)?;
        self.push(argv)?;
        self.push(stub)?;
        self.pc = entry;
        Ok(())
    }

    /// Executes exactly one instruction.
    ///
    /// Faults do not escape: they are logged, kept in [`Machine::last_error`]
    /// and turn the status into [`Status::Error`]. Stepping a machine that
    /// already exited or failed changes nothing.
    pub fn step(&mut self, trace: bool) -> Status {
        match self.status {
            Status::Exit | Status::Error => return self.status,
            Status::Init => self.status = Status::Running,
            Status::Running => {}
        }
        if let Err(err) = self.execute(trace) {
            error!(cycle = self.cycle, pc = self.pc / WORD_SIZE, %err, "vm fault");
            self.fault = Some(err);
            self.status = Status::Error;
        }
        self.status
    }

    /// Runs until `EXIT` or a fault.
    pub fn run(&mut self, trace: bool) -> VmResult<Word> {
        loop {
            match self.step(trace) {
                Status::Exit => return Ok(self.result),
                Status::Error => return Err(self.current_fault()),
                Status::Init | Status::Running => {}
            }
        }
    }

    /// Runs the instructions already committed and stops, without faulting,
    /// at the first one that is not complete yet.
    pub fn run_available(&mut self, trace: bool) -> VmResult<RunOutcome> {
        loop {
            match self.status {
                Status::Exit => return Ok(RunOutcome::Exited(self.result)),
                Status::Error => return Err(self.current_fault()),
                Status::Init | Status::Running => {}
            }
            if !self.next_instruction_committed() {
                return Ok(RunOutcome::Pending);
            }
            self.step(trace);
        }
    }

    pub fn run_with_debugger(
        &mut self,
        debugger: &mut crate::debugger::Debugger,
        trace: bool,
    ) -> VmResult<Word> {
        loop {
            if matches!(self.status, Status::Init | Status::Running) {
                debugger.on_instruction(self);
            }
            match self.step(trace) {
                Status::Exit => return Ok(self.result),
                Status::Error => return Err(self.current_fault()),
                Status::Init | Status::Running => {}
            }
        }
    }

    fn current_fault(&self) -> VmError {
        self.fault
            .clone()
            .unwrap_or(VmError::HostError("machine halted without a recorded fault".to_string()))
    }

    fn next_instruction_committed(&self) -> bool {
        let cell = self.pc / WORD_SIZE;
        if cell >= self.op_counter {
            return false;
        }
        let lookahead = self
            .memory
            .code
            .read_word(self.pc)
            .ok()
            .and_then(OpCode::from_word)
            .map(OpCode::lookahead)
            .unwrap_or(1);
        cell + lookahead <= self.op_counter
    }

    fn execute(&mut self, trace: bool) -> VmResult<()> {
        self.cycle += 1;
        self.instruction_pc = self.pc / WORD_SIZE;
        let word = self.fetch()?;
        let Some(op) = OpCode::from_word(word) else {
            if trace {
                self.host.trace(&format!("{}> ???? {word}", self.cycle));
            }
            return Err(VmError::UnknownOpcode(word));
        };
        if trace {
            self.trace_instruction(op);
        }

        match op {
            OpCode::Lea => {
                let offset = self.fetch()?;
                self.ax = Address::Stack(self.bp)
                    .encode()
                    .wrapping_add(offset.wrapping_mul(WORD_SIZE as Word));
            }
            OpCode::Imm => self.ax = self.fetch()?,
            OpCode::Jmp => {
                let target = self.fetch()?;
                self.pc = self.code_offset(target)?;
            }
            OpCode::Call => {
                let target = self.fetch()?;
                let target = self.code_offset(target)?;
                self.push(Address::Code(self.pc).encode())?;
                self.pc = target;
            }
            OpCode::Jz => {
                let target = self.fetch()?;
                if self.ax == 0 {
                    self.pc = self.code_offset(target)?;
                }
            }
            OpCode::Jnz => {
                let target = self.fetch()?;
                if self.ax != 0 {
                    self.pc = self.code_offset(target)?;
                }
            }
            OpCode::Ent => {
                let locals = self.fetch()?;
                self.push(Address::Stack(self.bp).encode())?;
                self.bp = self.sp;
                self.adjust_sp(locals.wrapping_neg())?;
            }
            OpCode::Adj => {
                let cells = self.fetch()?;
                self.adjust_sp(cells)?;
            }
            OpCode::Lev => {
                self.sp = self.bp;
                let saved_bp = self.pop()?;
                self.bp = self.stack_offset(saved_bp)?;
                let return_to = self.pop()?;
                self.pc = self.code_offset(return_to)?;
            }
            OpCode::Li => self.ax = self.memory.load_word(self.ax)?,
            OpCode::Lc => self.ax = self.memory.load_byte(self.ax)? as i8 as Word,
            OpCode::Si => {
                let address = self.pop()?;
                self.memory.store_word(address, self.ax)?;
            }
            OpCode::Sc => {
                let address = self.pop()?;
                let byte = self.ax as u8;
                self.memory.store_byte(address, byte)?;
                self.ax = byte as i8 as Word;
            }
            OpCode::Push => self.push(self.ax)?,

            OpCode::Or => self.binary(|lhs, rhs| Ok(lhs | rhs))?,
            OpCode::Xor => self.binary(|lhs, rhs| Ok(lhs ^ rhs))?,
            OpCode::And => self.binary(|lhs, rhs| Ok(lhs & rhs))?,
            OpCode::Eq => self.binary(|lhs, rhs| Ok((lhs == rhs) as Word))?,
            OpCode::Ne => self.binary(|lhs, rhs| Ok((lhs != rhs) as Word))?,
            OpCode::Lt => self.binary(|lhs, rhs| Ok((lhs < rhs) as Word))?,
            OpCode::Gt => self.binary(|lhs, rhs| Ok((lhs > rhs) as Word))?,
            OpCode::Le => self.binary(|lhs, rhs| Ok((lhs <= rhs) as Word))?,
            OpCode::Ge => self.binary(|lhs, rhs| Ok((lhs >= rhs) as Word))?,
            // shift counts are taken modulo the word width
            OpCode::Shl => self.binary(|lhs, rhs| Ok(lhs.wrapping_shl(rhs as u32)))?,
            OpCode::Shr => self.binary(|lhs, rhs| Ok(lhs.wrapping_shr(rhs as u32)))?,
            OpCode::Add => self.binary(|lhs, rhs| Ok(lhs.wrapping_add(rhs)))?,
            OpCode::Sub => self.binary(|lhs, rhs| Ok(lhs.wrapping_sub(rhs)))?,
            OpCode::Mul => self.binary(|lhs, rhs| Ok(lhs.wrapping_mul(rhs)))?,
            OpCode::Div => self.binary(|lhs, rhs| {
                if rhs == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Ok(lhs.wrapping_div(rhs))
            })?,
            OpCode::Mod => self.binary(|lhs, rhs| {
                if rhs == 0 {
                    return Err(VmError::DivisionByZero);
                }
                Ok(lhs.wrapping_rem(rhs))
            })?,

            OpCode::Open => {
                let path = self.memory.c_string(self.stack_arg(1)?)?;
                let flags = self.stack_arg(0)? as i32;
                self.ax = self.host.open(&path, flags);
            }
            OpCode::Read => {
                let fd = self.stack_arg(2)? as i32;
                let buf = self.stack_arg(1)?;
                let count = self.stack_arg(0)?;
                let len = byte_count(buf, count)?;
                self.ax = if len == 0 {
                    self.host.read(fd, &mut [])
                } else {
                    let target = self.memory.bytes_mut(buf, len)?;
                    self.host.read(fd, target)
                };
            }
            OpCode::Clos => {
                let fd = self.stack_arg(0)? as i32;
                self.ax = self.host.close(fd);
            }
            OpCode::Prtf => self.ax = self.print_formatted()?,
            OpCode::Malc => {
                let size = self.stack_arg(0)?;
                self.ax = match usize::try_from(size) {
                    Ok(size) => self.memory.heap.allocate(size)? as Word,
                    Err(_) => 0,
                };
            }
            OpCode::Free => {
                let ptr = self.stack_arg(0)?;
                match Address::decode(ptr) {
                    Address::Host(raw) => self.memory.heap.free(raw)?,
                    _ => {
                        return Err(VmError::SegmentMismatch {
                            expected: "host heap",
                            address: ptr,
                        });
                    }
                }
            }
            OpCode::Mset => {
                let dst = self.stack_arg(2)?;
                let value = self.stack_arg(1)? as u8;
                let len = byte_count(dst, self.stack_arg(0)?)?;
                if len > 0 {
                    self.memory.bytes_mut(dst, len)?.fill(value);
                }
                self.ax = dst;
            }
            OpCode::Mcmp => {
                let lhs = self.stack_arg(2)?;
                let rhs = self.stack_arg(1)?;
                let len = byte_count(lhs, self.stack_arg(0)?)?;
                self.ax = if len == 0 {
                    0
                } else {
                    let lhs = self.memory.bytes(lhs, len)?;
                    let rhs = self.memory.bytes(rhs, len)?;
                    unsafe { libc::memcmp(lhs.as_ptr().cast(), rhs.as_ptr().cast(), len) as Word }
                };
            }
            OpCode::Exit => {
                self.result = self.stack_arg(0)?;
                self.status = Status::Exit;
                info!(code = self.result, cycle = self.cycle, "vm exit");
            }
        }
        Ok(())
    }

    fn trace_instruction(&mut self, op: OpCode) {
        let line = if op.has_operand() {
            let operand = self
                .committed_cell(self.pc / WORD_SIZE)
                .map(|value| crate::disasm::format_operand(op, value))
                .unwrap_or_else(|_| "<pending>".to_string());
            format!("{}> {:<4} {operand}", self.cycle, op.mnemonic())
        } else {
            format!("{}> {:<4}", self.cycle, op.mnemonic())
        };
        self.host.trace(&line);
    }

    /// `PRTF` is emitted as `PRTF, ADJ k`; `k` counts the format string plus
    /// the values, which sit above `sp` in push order.
    fn print_formatted(&mut self) -> VmResult<Word> {
        let next = self.pc / WORD_SIZE;
        if self.committed_cell(next)? != OpCode::Adj as Word {
            return Err(VmError::MalformedHostCall("PRTF must be followed by ADJ"));
        }
        let arg_count = self.committed_cell(next + 1)?;
        let arg_count = usize::try_from(arg_count)
            .ok()
            .filter(|count| *count >= 1)
            .ok_or(VmError::MalformedHostCall("PRTF needs at least a format string"))?;

        let template = self.memory.c_string(self.stack_arg(arg_count - 1)?)?;
        let value_count = (arg_count - 1).min(PRTF_MAX_VALUES);
        let mut values = Vec::with_capacity(value_count);
        for slot in 0..value_count {
            values.push(self.stack_arg(arg_count - 2 - slot)?);
        }
        let memory = &self.memory;
        let text = printf::format(template.as_bytes(), &values, |address| {
            memory.c_string(address).map(|text| text.into_bytes())
        })?;
        Ok(self.host.write_stdout(&text))
    }

    fn binary(&mut self, op: impl FnOnce(Word, Word) -> VmResult<Word>) -> VmResult<()> {
        let lhs = self.pop()?;
        self.ax = op(lhs, self.ax)?;
        Ok(())
    }

    fn fetch(&mut self) -> VmResult<Word> {
        let value = self.committed_cell(self.pc / WORD_SIZE)?;
        self.pc += WORD_SIZE;
        Ok(value)
    }

    fn committed_cell(&self, cell: usize) -> VmResult<Word> {
        if cell >= self.op_counter {
            return Err(VmError::PcOutOfBounds {
                pc: cell,
                op_counter: self.op_counter,
            });
        }
        self.memory.code.read_word(cell * WORD_SIZE)
    }

    fn push(&mut self, value: Word) -> VmResult<()> {
        if self.sp < WORD_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.sp -= WORD_SIZE;
        self.memory.stack.write_word(self.sp, value)
    }

    fn pop(&mut self) -> VmResult<Word> {
        if self.sp + WORD_SIZE > self.stack_top() {
            return Err(VmError::StackUnderflow);
        }
        let value = self.memory.stack.read_word(self.sp)?;
        self.sp += WORD_SIZE;
        Ok(value)
    }

    /// `sp[index]`, read without popping.
    fn stack_arg(&self, index: usize) -> VmResult<Word> {
        let offset = index
            .checked_mul(WORD_SIZE)
            .and_then(|delta| self.sp.checked_add(delta))
            .filter(|offset| offset.saturating_add(WORD_SIZE) <= self.stack_top())
            .ok_or(VmError::StackUnderflow)?;
        self.memory.stack.read_word(offset)
    }

    fn adjust_sp(&mut self, cells: Word) -> VmResult<()> {
        let delta = cells.checked_mul(WORD_SIZE as Word);
        let target = delta.and_then(|delta| (self.sp as Word).checked_add(delta));
        match target {
            Some(target) if target < 0 => Err(VmError::StackOverflow),
            Some(target) if target as usize <= self.stack_top() => {
                self.sp = target as usize;
                Ok(())
            }
            Some(_) => Err(VmError::StackUnderflow),
            None => Err(VmError::StackOverflow),
        }
    }

    fn code_offset(&self, address: Word) -> VmResult<usize> {
        match Address::decode(address) {
            Address::Code(offset) if offset % WORD_SIZE != 0 => {
                Err(VmError::UnalignedCode(address))
            }
            Address::Code(offset) if offset < self.memory.code.len() => Ok(offset),
            Address::Code(_) => Err(VmError::SegmentFault {
                address,
                width: WORD_SIZE,
            }),
            _ => Err(VmError::SegmentMismatch {
                expected: "code",
                address,
            }),
        }
    }

    fn stack_offset(&self, address: Word) -> VmResult<usize> {
        match Address::decode(address) {
            Address::Stack(offset) if offset <= self.stack_top() => Ok(offset),
            Address::Stack(_) => Err(VmError::SegmentFault {
                address,
                width: WORD_SIZE,
            }),
            _ => Err(VmError::SegmentMismatch {
                expected: "stack",
                address,
            }),
        }
    }
}

fn byte_count(address: Word, count: Word) -> VmResult<usize> {
    usize::try_from(count).map_err(|_| VmError::SegmentFault {
        address,
        width: 0,
    })
}
