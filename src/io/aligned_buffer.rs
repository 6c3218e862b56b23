//! Block-aligned buffers for direct IO

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::error::{IoError, IoResult};

/// Default block alignment required by the direct IO backend
pub const BLOCK_SIZE: usize = 512;

/// A buffer aligned to a power-of-two block size
///
/// Direct IO requires the buffer address, the file offset and the transfer
/// size to be multiples of the device block size. The default alignment is
/// [`BLOCK_SIZE`]; the portable backend accepts an alignment of 1.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    alignment: usize,
}

// Safety: the allocation is uniquely owned and never aliased
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a new buffer aligned to [`BLOCK_SIZE`]
    ///
    /// Capacity will be rounded up to the nearest BLOCK_SIZE multiple.
    pub fn new(capacity: usize) -> IoResult<Self> {
        Self::with_alignment(capacity, BLOCK_SIZE)
    }

    /// Create a new buffer with an explicit power-of-two alignment
    pub fn with_alignment(capacity: usize, alignment: usize) -> IoResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(IoError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }

        let capacity = Self::round_up_to(capacity, alignment);
        if capacity == 0 {
            return Err(IoError::BufferSize { size: 0, alignment });
        }

        let layout = Layout::from_size_align(capacity, alignment).map_err(|_| {
            IoError::Alignment {
                expected: alignment,
                actual: 0,
            }
        })?;

        // Safety: capacity is non-zero
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| IoError::Backend {
            code: super::ErrorCode::AllocateMemory,
            message: format!("failed to allocate {} byte aligned buffer", capacity),
        })?;

        Ok(Self {
            ptr,
            len: 0,
            capacity,
            alignment,
        })
    }

    /// Create a buffer holding `count` blocks
    pub fn blocks(count: usize) -> IoResult<Self> {
        Self::new(count * BLOCK_SIZE)
    }

    /// Round up a size to the nearest BLOCK_SIZE multiple
    #[inline]
    pub fn round_up(size: usize) -> usize {
        Self::round_up_to(size, BLOCK_SIZE)
    }

    /// Round up a size to a power-of-two alignment
    #[inline]
    pub fn round_up_to(size: usize, alignment: usize) -> usize {
        (size + alignment - 1) & !(alignment - 1)
    }

    /// Check if a size is block-aligned
    #[inline]
    pub fn is_aligned(size: usize) -> bool {
        size.is_multiple_of(BLOCK_SIZE)
    }

    /// Alignment this buffer was allocated with
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Allocated size in bytes, a multiple of the alignment
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes holding record data
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no record data has been placed in the buffer
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` bytes as record data
    ///
    /// # Panics
    /// When `len` exceeds the capacity
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity,
            "length {} beyond capacity {}",
            len,
            self.capacity
        );
        self.len = len;
    }

    /// Raw start of the allocation, handed to the kernel for transfers
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable start of the allocation
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Record data, `len` bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the first len bytes are initialized
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole allocation, `capacity` bytes
    ///
    /// Writes transfer from the start of the allocation, so a record shorter
    /// than a block is written padded with whatever follows it (zeros for a
    /// fresh or zeroed buffer).
    #[inline]
    pub fn as_full_slice(&self) -> &[u8] {
        // Safety: ptr is valid and initialized for capacity bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    /// Mutable view over the whole allocation
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for capacity bytes
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Forget the record data without touching the bytes
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Fill the buffer with zeros and reset its length
    pub fn zero(&mut self) {
        // Safety: ptr is valid for capacity bytes
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.capacity);
        }
        self.len = 0;
    }

    /// Fill the whole capacity with `byte` and mark it as data
    pub fn fill(&mut self, byte: u8) {
        // Safety: ptr is valid for capacity bytes
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.capacity);
        }
        self.len = self.capacity;
    }

    /// Replace the contents with `data`
    pub fn copy_from_slice(&mut self, data: &[u8]) -> IoResult<()> {
        if data.len() > self.capacity {
            return Err(IoError::BufferSize {
                size: data.len(),
                alignment: self.capacity,
            });
        }

        // Safety: data fits and cannot alias our own allocation
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, self.alignment)
            .expect("layout was valid at allocation");
        // Safety: same size and alignment as the allocation
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: the first len bytes are initialized and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .finish()
    }
}
