pub mod assembler;
pub mod debugger;
pub mod disasm;
#[cfg(feature = "cli")]
pub mod logging;
pub mod vm;

pub use assembler::{
    AsmParseError, Assembler, AssemblerError, LoadedProgram, Program, assemble, parse_instruction,
};
pub use debugger::{Debugger, StepMode};
pub use disasm::{disassemble, disassemble_range};
pub use vm::{
    Address, DEFAULT_POOLSIZE, ENTRY_STUB_CELLS, Host, Machine, MemoryError, OpCode, Registers,
    RunOutcome, SegmentKind, Status, SystemHost, VmError, VmResult, WORD_SIZE, Word,
    render_vm_error,
};
