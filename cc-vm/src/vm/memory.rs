use std::ffi::CString;

use super::host::HostHeap;
use super::{VmError, VmResult};

/// Machine word. Every code and stack cell holds exactly one.
pub type Word = i64;

pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

const TAG_SHIFT: u32 = 56;
const OFFSET_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Code,
    Data,
    Stack,
}

impl SegmentKind {
    pub fn name(self) -> &'static str {
        match self {
            SegmentKind::Code => "code",
            SegmentKind::Data => "data",
            SegmentKind::Stack => "stack",
        }
    }

    fn tag(self) -> u64 {
        match self {
            SegmentKind::Code => 0x01,
            SegmentKind::Data => 0x02,
            SegmentKind::Stack => 0x03,
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A guest address, decoded from the tagged word representation.
///
/// The top byte of a word selects the segment and the remaining 56 bits are a
/// byte offset inside it. Words whose top byte is not a segment tag are opaque
/// host pointers and are only dereferenced through the [`HostHeap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    Code(usize),
    Data(usize),
    Stack(usize),
    Host(u64),
}

impl Address {
    pub fn decode(word: Word) -> Self {
        let raw = word as u64;
        let offset = (raw & OFFSET_MASK) as usize;
        match raw >> TAG_SHIFT {
            0x01 => Address::Code(offset),
            0x02 => Address::Data(offset),
            0x03 => Address::Stack(offset),
            _ => Address::Host(raw),
        }
    }

    pub fn encode(self) -> Word {
        match self {
            Address::Code(offset) => tagged(SegmentKind::Code, offset),
            Address::Data(offset) => tagged(SegmentKind::Data, offset),
            Address::Stack(offset) => tagged(SegmentKind::Stack, offset),
            Address::Host(raw) => raw as Word,
        }
    }

    pub fn segment(self) -> Option<SegmentKind> {
        match self {
            Address::Code(_) => Some(SegmentKind::Code),
            Address::Data(_) => Some(SegmentKind::Data),
            Address::Stack(_) => Some(SegmentKind::Stack),
            Address::Host(_) => None,
        }
    }
}

fn tagged(kind: SegmentKind, offset: usize) -> Word {
    ((kind.tag() << TAG_SHIFT) | (offset as u64 & OFFSET_MASK)) as Word
}

/// Whether a raw host pointer can be handed to the guest without being
/// mistaken for a segment address.
pub fn is_host_pointer(raw: u64) -> bool {
    matches!(Address::decode(raw as Word), Address::Host(_))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryError {
    PoolTooSmall(usize),
    Allocation { segment: SegmentKind, size: usize },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::PoolTooSmall(size) => {
                write!(f, "pool size {size} is smaller than one {WORD_SIZE}-byte word")
            }
            MemoryError::Allocation { segment, size } => {
                write!(f, "could not allocate {size} bytes for {segment} segment")
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// One fixed-capacity, zero-initialised memory region.
pub struct Segment {
    kind: SegmentKind,
    bytes: Vec<u8>,
}

impl Segment {
    pub fn allocate(kind: SegmentKind, size: usize) -> Result<Self, MemoryError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| MemoryError::Allocation {
                segment: kind,
                size,
            })?;
        bytes.resize(size, 0);
        Ok(Self { kind, bytes })
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn zero(&mut self) {
        self.bytes.fill(0);
    }

    pub fn address(&self, offset: usize) -> Address {
        match self.kind {
            SegmentKind::Code => Address::Code(offset),
            SegmentKind::Data => Address::Data(offset),
            SegmentKind::Stack => Address::Stack(offset),
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> VmResult<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.bytes[range])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> VmResult<&mut [u8]> {
        let range = self.range(offset, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Everything from `offset` to the end of the segment.
    pub fn tail(&self, offset: usize) -> VmResult<&[u8]> {
        if offset >= self.bytes.len() {
            return Err(self.fault(offset, 1));
        }
        Ok(&self.bytes[offset..])
    }

    pub fn read_word(&self, offset: usize) -> VmResult<Word> {
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(self.bytes(offset, WORD_SIZE)?);
        Ok(Word::from_ne_bytes(buf))
    }

    pub fn write_word(&mut self, offset: usize, value: Word) -> VmResult<()> {
        self.bytes_mut(offset, WORD_SIZE)?
            .copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    fn range(&self, offset: usize, len: usize) -> VmResult<std::ops::Range<usize>> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .map(|end| offset..end)
            .ok_or_else(|| self.fault(offset, len))
    }

    fn fault(&self, offset: usize, width: usize) -> VmError {
        VmError::SegmentFault {
            address: self.address(offset).encode(),
            width,
        }
    }
}

/// The three segments plus the host heap, addressed through tagged words.
pub struct Memory {
    pub code: Segment,
    pub data: Segment,
    pub stack: Segment,
    pub heap: HostHeap,
}

impl Memory {
    pub fn allocate(poolsize: usize) -> Result<Self, MemoryError> {
        if poolsize < WORD_SIZE {
            return Err(MemoryError::PoolTooSmall(poolsize));
        }
        let code = Segment::allocate(SegmentKind::Code, poolsize)?;
        let data = Segment::allocate(SegmentKind::Data, poolsize)?;
        let stack = Segment::allocate(SegmentKind::Stack, poolsize)?;
        Ok(Self {
            code,
            data,
            stack,
            heap: HostHeap::default(),
        })
    }

    pub fn clear(&mut self) {
        self.code.zero();
        self.data.zero();
        self.stack.zero();
        self.heap.release_all();
    }

    pub fn bytes(&self, address: Word, len: usize) -> VmResult<&[u8]> {
        match Address::decode(address) {
            Address::Code(offset) => self.code.bytes(offset, len),
            Address::Data(offset) => self.data.bytes(offset, len),
            Address::Stack(offset) => self.stack.bytes(offset, len),
            Address::Host(raw) => self.heap.bytes(raw, len),
        }
    }

    pub fn bytes_mut(&mut self, address: Word, len: usize) -> VmResult<&mut [u8]> {
        match Address::decode(address) {
            Address::Code(offset) => self.code.bytes_mut(offset, len),
            Address::Data(offset) => self.data.bytes_mut(offset, len),
            Address::Stack(offset) => self.stack.bytes_mut(offset, len),
            Address::Host(raw) => self.heap.bytes_mut(raw, len),
        }
    }

    pub fn load_word(&self, address: Word) -> VmResult<Word> {
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(self.bytes(address, WORD_SIZE)?);
        Ok(Word::from_ne_bytes(buf))
    }

    pub fn store_word(&mut self, address: Word, value: Word) -> VmResult<()> {
        self.bytes_mut(address, WORD_SIZE)?
            .copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    pub fn load_byte(&self, address: Word) -> VmResult<u8> {
        Ok(self.bytes(address, 1)?[0])
    }

    pub fn store_byte(&mut self, address: Word, value: u8) -> VmResult<()> {
        self.bytes_mut(address, 1)?[0] = value;
        Ok(())
    }

    /// Reads a NUL-terminated string; the terminator must lie inside the same
    /// segment or heap block as the start address.
    pub fn c_string(&self, address: Word) -> VmResult<CString> {
        let tail = match Address::decode(address) {
            Address::Code(offset) => self.code.tail(offset)?,
            Address::Data(offset) => self.data.tail(offset)?,
            Address::Stack(offset) => self.stack.tail(offset)?,
            Address::Host(raw) => self.heap.tail(raw)?,
        };
        let end = tail
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(VmError::SegmentFault {
                address,
                width: tail.len() + 1,
            })?;
        CString::new(&tail[..end]).map_err(|err| VmError::HostError(err.to_string()))
    }
}
