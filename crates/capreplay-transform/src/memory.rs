//! Sparse host memory used to hold command argument data during replay construction.
//!
//! Two kinds of memory live here:
//! - **application memory**: bytes at the addresses the captured application used, populated
//!   from command read/write observations.
//! - **scratch memory**: short-lived blocks allocated by transforms while rewriting a command
//!   (see [`crate::ScratchScope`]). Scratch blocks live in a dedicated address window above
//!   [`SCRATCH_BASE`] and are bounded by a byte budget.

use std::collections::BTreeMap;
use std::fmt;

/// Start of the scratch address window.
pub const SCRATCH_BASE: u64 = 0x7f00_0000_0000;

const SCRATCH_ALIGNMENT: u64 = 16;

/// Default scratch budget for a [`HostMemory`] pool.
pub const DEFAULT_SCRATCH_LIMIT: u64 = 16 * 1024 * 1024;

/// Address in the replay host memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer(pub u64);

impl Pointer {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
}

impl MemoryRange {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> Option<u64> {
        self.base.checked_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("host memory access out of bounds (addr=0x{addr:x}, len={len})")]
    OutOfBounds { addr: u64, len: u64 },
    #[error("no scratch allocation at 0x{0:x}")]
    UnknownAllocation(u64),
    #[error("scratch memory exhausted (requested={requested}, remaining={remaining})")]
    Exhausted { requested: u64, remaining: u64 },
    #[error("unterminated string at 0x{0:x}")]
    UnterminatedString(u64),
    #[error("string at 0x{0:x} is not valid UTF-8")]
    InvalidUtf8(u64),
    #[error("write at 0x{addr:x} (len={len}) straddles a live scratch block")]
    ScratchOverlap { addr: u64, len: u64 },
}

/// Values that can be written into host memory as argument data.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Strings are stored NUL-terminated.
impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
        out.push(0);
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

/// Pointer arrays are stored as little-endian u64s.
impl Encode for [Pointer] {
    fn encode(&self, out: &mut Vec<u8>) {
        for ptr in self {
            out.extend_from_slice(&ptr.0.to_le_bytes());
        }
    }
}

impl Encode for Vec<Pointer> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_slice().encode(out);
    }
}

#[derive(Debug, Clone)]
pub struct HostMemory {
    /// Application memory segments keyed by base address. Segments never overlap.
    segments: BTreeMap<u64, Vec<u8>>,
    /// Live scratch allocations keyed by base address.
    scratch: BTreeMap<u64, Vec<u8>>,
    scratch_cursor: u64,
    scratch_used: u64,
    scratch_limit: u64,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new(DEFAULT_SCRATCH_LIMIT)
    }
}

impl HostMemory {
    pub fn new(scratch_limit: u64) -> Self {
        Self {
            segments: BTreeMap::new(),
            scratch: BTreeMap::new(),
            scratch_cursor: SCRATCH_BASE,
            scratch_used: 0,
            scratch_limit,
        }
    }

    /// Write `bytes` at `addr`.
    ///
    /// Writes that land entirely inside a live scratch allocation update it in place; anything
    /// else goes to application memory, merging with any segments it overlaps or touches.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let len = bytes.len() as u64;
        let end = addr
            .checked_add(len)
            .ok_or(MemoryError::OutOfBounds { addr, len })?;
        if bytes.is_empty() {
            return Ok(());
        }

        // Scratch blocks never overlap application segments, so a write is either entirely
        // inside one block or entirely outside all of them.
        if let Some((&base, block)) = self.scratch.range_mut(..end).next_back() {
            let block_end = base + block.len() as u64;
            if block_end > addr {
                if base <= addr && end <= block_end {
                    let off = (addr - base) as usize;
                    block[off..off + bytes.len()].copy_from_slice(bytes);
                    return Ok(());
                }
                return Err(MemoryError::ScratchOverlap { addr, len });
            }
        }

        // Collect every segment that overlaps or abuts [addr, end).
        let mut start = addr;
        let mut merged_end = end;
        let touching: Vec<u64> = self
            .segments
            .range(..=end)
            .filter(|(&base, data)| base + data.len() as u64 >= addr)
            .map(|(&base, _)| base)
            .collect();
        for &base in &touching {
            let seg_end = base + self.segments[&base].len() as u64;
            start = start.min(base);
            merged_end = merged_end.max(seg_end);
        }

        let mut merged = vec![0u8; (merged_end - start) as usize];
        for base in touching {
            if let Some(data) = self.segments.remove(&base) {
                let off = (base - start) as usize;
                merged[off..off + data.len()].copy_from_slice(&data);
            }
        }
        let off = (addr - start) as usize;
        merged[off..off + bytes.len()].copy_from_slice(bytes);
        self.segments.insert(start, merged);
        Ok(())
    }

    /// Borrow `len` bytes at `addr`. The whole range must lie inside a single segment or
    /// scratch allocation.
    pub fn read(&self, addr: u64, len: u64) -> Result<&[u8], MemoryError> {
        let oob = MemoryError::OutOfBounds { addr, len };
        let end = addr.checked_add(len).ok_or(oob.clone())?;
        for region in [&self.scratch, &self.segments] {
            if let Some((&base, data)) = region.range(..=addr).next_back() {
                if end <= base + data.len() as u64 {
                    let off = (addr - base) as usize;
                    return Ok(&data[off..off + len as usize]);
                }
            }
        }
        Err(oob)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let bytes = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let bytes = self.read(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read `count` pointers starting at `list`. A zero count never touches memory, so a null
    /// list is valid for empty arrays.
    pub fn read_pointers(&self, list: Pointer, count: u32) -> Result<Vec<Pointer>, MemoryError> {
        (0..u64::from(count))
            .map(|i| {
                let addr = list.0.checked_add(i * 8).ok_or(MemoryError::OutOfBounds {
                    addr: list.0,
                    len: u64::from(count) * 8,
                })?;
                self.read_u64(addr).map(Pointer)
            })
            .collect()
    }

    /// Read a NUL-terminated UTF-8 string.
    pub fn read_cstr(&self, ptr: Pointer) -> Result<String, MemoryError> {
        let addr = ptr.0;
        let (base, data) = [&self.scratch, &self.segments]
            .into_iter()
            .find_map(|region| {
                region
                    .range(..=addr)
                    .next_back()
                    .filter(|(&base, data)| addr < base + data.len() as u64)
            })
            .ok_or(MemoryError::OutOfBounds { addr, len: 1 })?;
        let tail = &data[(addr - base) as usize..];
        let nul = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(MemoryError::UnterminatedString(addr))?;
        String::from_utf8(tail[..nul].to_vec()).map_err(|_| MemoryError::InvalidUtf8(addr))
    }

    /// Allocate a scratch block initialized with `bytes`.
    pub fn alloc(&mut self, bytes: Vec<u8>) -> Result<MemoryRange, MemoryError> {
        let size = bytes.len() as u64;
        let remaining = self.scratch_limit.saturating_sub(self.scratch_used);
        if size > remaining {
            return Err(MemoryError::Exhausted {
                requested: size,
                remaining,
            });
        }

        let exhausted = MemoryError::Exhausted {
            requested: size,
            remaining,
        };
        // Zero-sized blocks still get a distinct address.
        let stride = align_up(size.max(1), SCRATCH_ALIGNMENT);
        let base = self
            .next_free_scratch(stride)
            .ok_or_else(|| exhausted.clone())?;
        self.scratch_cursor = base.checked_add(stride).ok_or(exhausted)?;
        self.scratch_used += size;
        self.scratch.insert(base, bytes);
        Ok(MemoryRange::new(base, size))
    }

    /// First aligned address at or above the cursor where `stride` bytes do not overlap any
    /// application segment.
    fn next_free_scratch(&self, stride: u64) -> Option<u64> {
        let mut base = self.scratch_cursor;
        loop {
            let end = base.checked_add(stride)?;
            match self.segments.range(..end).next_back() {
                Some((&seg, data)) if seg + data.len() as u64 > base => {
                    base = align_up(seg.checked_add(data.len() as u64)?, SCRATCH_ALIGNMENT);
                }
                _ => return Some(base),
            }
        }
    }

    /// Release the scratch block starting at `base`.
    pub fn free(&mut self, base: u64) -> Result<(), MemoryError> {
        let block = self
            .scratch
            .remove(&base)
            .ok_or(MemoryError::UnknownAllocation(base))?;
        self.scratch_used -= block.len() as u64;
        Ok(())
    }

    pub fn is_allocated(&self, ptr: Pointer) -> bool {
        self.scratch.contains_key(&ptr.0)
    }

    /// Number of live scratch allocations.
    pub fn scratch_allocations(&self) -> usize {
        self.scratch.len()
    }

    pub fn scratch_used(&self) -> u64 {
        self.scratch_used
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
