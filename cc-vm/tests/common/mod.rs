#![allow(dead_code, unused_imports)]

use std::cell::RefCell;
use std::ffi::CStr;
use std::rc::Rc;

pub use vm::{
    Address, Assembler, Host, Machine, OpCode, RunOutcome, Status, SystemHost, VmError, WORD_SIZE,
    Word, assemble,
};

/// Captures `PRTF` output and trace lines; file calls go to the real system.
#[derive(Default)]
pub struct RecordingHost {
    pub stdout: Rc<RefCell<Vec<u8>>>,
    pub traces: Rc<RefCell<Vec<String>>>,
    system: SystemHost,
}

impl Host for RecordingHost {
    fn open(&mut self, path: &CStr, flags: i32) -> Word {
        self.system.open(path, flags)
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> Word {
        self.system.read(fd, buf)
    }

    fn close(&mut self, fd: i32) -> Word {
        self.system.close(fd)
    }

    fn write_stdout(&mut self, bytes: &[u8]) -> Word {
        self.stdout.borrow_mut().extend_from_slice(bytes);
        bytes.len() as Word
    }

    fn trace(&mut self, line: &str) {
        self.traces.borrow_mut().push(line.to_string());
    }
}

pub struct Recorded {
    pub machine: Machine,
    pub stdout: Rc<RefCell<Vec<u8>>>,
    pub traces: Rc<RefCell<Vec<String>>>,
}

impl Recorded {
    pub fn stdout_text(&self) -> String {
        String::from_utf8(self.stdout.borrow().clone()).expect("stdout should be utf-8")
    }

    pub fn trace_lines(&self) -> Vec<String> {
        self.traces.borrow().clone()
    }
}

pub fn recording_machine(poolsize: usize) -> Recorded {
    let host = RecordingHost::default();
    let stdout = Rc::clone(&host.stdout);
    let traces = Rc::clone(&host.traces);
    let machine = Machine::with_host(poolsize, Box::new(host)).expect("allocate");
    Recorded {
        machine,
        stdout,
        traces,
    }
}

pub fn op(op: OpCode) -> Word {
    op as Word
}

/// Runs `source` with a recording host and returns the exit value.
pub fn run_source(source: &str) -> (Recorded, Result<Word, VmError>) {
    let program = assemble(source).expect("assemble should succeed");
    let mut recorded = recording_machine(64 * 1024);
    program
        .load(&mut recorded.machine)
        .expect("program should load");
    let result = recorded.machine.run(false);
    (recorded, result)
}
