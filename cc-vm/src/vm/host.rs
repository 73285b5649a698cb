use std::collections::BTreeMap;
use std::ffi::CStr;
use std::io::{self, Write};

use super::memory::{Word, is_host_pointer};
use super::{VmError, VmResult};

/// Services the `OPEN`, `READ`, `CLOS` and `PRTF` opcodes delegate to, plus the
/// sink for single-step trace lines.
///
/// Return values follow the C conventions guest programs expect: a
/// non-negative result on success and `-1` on failure.
pub trait Host {
    fn open(&mut self, path: &CStr, flags: i32) -> Word;

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> Word;

    fn close(&mut self, fd: i32) -> Word;

    /// Receives fully formatted `PRTF` output; returns the byte count written.
    fn write_stdout(&mut self, bytes: &[u8]) -> Word;

    fn trace(&mut self, line: &str);
}

/// Talks to the real process: file descriptors through `libc`, output on stdout.
#[derive(Debug, Default)]
pub struct SystemHost;

impl Host for SystemHost {
    fn open(&mut self, path: &CStr, flags: i32) -> Word {
        unsafe { libc::open(path.as_ptr(), flags as libc::c_int) as Word }
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> Word {
        unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as Word }
    }

    fn close(&mut self, fd: i32) -> Word {
        unsafe { libc::close(fd) as Word }
    }

    fn write_stdout(&mut self, bytes: &[u8]) -> Word {
        let mut stdout = io::stdout().lock();
        match stdout.write_all(bytes).and_then(|_| stdout.flush()) {
            Ok(()) => bytes.len() as Word,
            Err(_) => -1,
        }
    }

    fn trace(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Blocks handed out by `MALC`, keyed by their raw host address.
///
/// Every host-pointer dereference is checked against the live blocks, so a
/// guest can only touch memory it allocated and has not freed yet.
#[derive(Debug, Default)]
pub struct HostHeap {
    blocks: BTreeMap<u64, usize>,
}

impl HostHeap {
    /// Returns the raw address of a zeroed block, or `0` when the host is out
    /// of memory.
    pub fn allocate(&mut self, size: usize) -> VmResult<u64> {
        if size == 0 {
            return Ok(0);
        }
        // zeroed so that every byte the guest can observe is initialised
        let ptr = unsafe { libc::calloc(1, size) } as u64;
        if ptr == 0 {
            return Ok(0);
        }
        if !is_host_pointer(ptr) {
            unsafe { libc::free(ptr as *mut libc::c_void) };
            return Err(VmError::HostError(format!(
                "host allocation at 0x{ptr:x} overlaps the segment tag space"
            )));
        }
        self.blocks.insert(ptr, size);
        Ok(ptr)
    }

    pub fn free(&mut self, ptr: u64) -> VmResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        self.blocks.remove(&ptr).ok_or(VmError::SegmentFault {
            address: ptr as Word,
            width: 0,
        })?;
        unsafe { libc::free(ptr as *mut libc::c_void) };
        Ok(())
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn release_all(&mut self) {
        for &ptr in self.blocks.keys() {
            unsafe { libc::free(ptr as *mut libc::c_void) };
        }
        self.blocks.clear();
    }

    pub fn bytes(&self, ptr: u64, len: usize) -> VmResult<&[u8]> {
        self.check(ptr, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const u8, len) })
    }

    pub fn bytes_mut(&mut self, ptr: u64, len: usize) -> VmResult<&mut [u8]> {
        self.check(ptr, len)?;
        if len == 0 {
            return Ok(&mut []);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) })
    }

    /// Everything from `ptr` to the end of the block containing it.
    pub fn tail(&self, ptr: u64) -> VmResult<&[u8]> {
        let (base, size) = self.block_containing(ptr, 1).ok_or(VmError::SegmentFault {
            address: ptr as Word,
            width: 1,
        })?;
        let len = (base + size as u64 - ptr) as usize;
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const u8, len) })
    }

    fn check(&self, ptr: u64, len: usize) -> VmResult<()> {
        self.block_containing(ptr, len)
            .map(|_| ())
            .ok_or(VmError::SegmentFault {
                address: ptr as Word,
                width: len,
            })
    }

    fn block_containing(&self, ptr: u64, len: usize) -> Option<(u64, usize)> {
        let (&base, &size) = self.blocks.range(..=ptr).next_back()?;
        let end = ptr.checked_add(len as u64)?;
        (end <= base + size as u64).then_some((base, size))
    }
}

impl Drop for HostHeap {
    fn drop(&mut self) {
        self.release_all();
    }
}
