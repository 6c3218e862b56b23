//! Sequential journal file
//!
//! A named file in the journal directory with a write/read cursor. Appends go
//! through [`AsyncFile`] and complete asynchronously; the blocking variants
//! wait for the callback.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::io::{AlignedBuffer, AsyncFile, BufferCallback, IoCallback, IoStats, WaitCallback};
use crate::journal::error::JournalResult;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Fill block sizes tried largest first
const FILL_BLOCK_SIZES: [usize; 4] = [100 * MIB, 10 * MIB, MIB, 10 * KIB];

/// A journal file with a sequential cursor
#[derive(Debug)]
pub struct SequentialFile {
    directory: PathBuf,
    file_name: String,
    max_io: usize,
    position: AtomicU64,
    file: AsyncFile,
}

impl SequentialFile {
    pub(crate) fn new(directory: &Path, file_name: String, max_io: usize, file: AsyncFile) -> Self {
        Self {
            directory: directory.to_path_buf(),
            file_name,
            max_io,
            position: AtomicU64::new(0),
            file,
        }
    }

    /// Open with the factory's configured concurrency
    pub fn open(&self) -> JournalResult<()> {
        self.open_with(self.max_io)
    }

    /// Open allowing `max_io` concurrent operations
    pub fn open_with(&self, max_io: usize) -> JournalResult<()> {
        self.file.open(self.path(), max_io)?;
        self.position.store(0, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    /// Whether the file exists on disk
    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Alignment required for buffers, positions and sizes
    pub fn alignment(&self) -> usize {
        self.file.alignment()
    }

    /// Round `position` up to the next aligned offset
    pub fn calculate_block_start(&self, position: u64) -> u64 {
        let alignment = self.alignment() as u64;
        position.div_ceil(alignment) * alignment
    }

    /// Current cursor
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    fn advance(&self, bytes: usize) -> u64 {
        self.position.fetch_add(bytes as u64, Ordering::AcqRel)
    }

    /// Undo `advance` for a request that was never submitted
    ///
    /// Only succeeds while no other caller has moved the cursor since; a
    /// concurrent advance keeps its own reservation and the gap stays.
    fn rollback(&self, position: u64, bytes: usize) {
        let advanced = position + bytes as u64;
        if self
            .position
            .compare_exchange(advanced, position, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(
                file = %self.file_name,
                position,
                bytes,
                "Cursor moved concurrently, not rolled back"
            );
        }
    }

    /// Write the buffer's data at the cursor and advance it
    pub fn write(&self, buffer: AlignedBuffer, callback: Box<dyn IoCallback>) -> JournalResult<()> {
        let size = buffer.len();
        let position = self.advance(size);
        if let Err(e) = self.file.write(position, size, buffer, callback) {
            // Nothing was submitted
            self.rollback(position, size);
            return Err(e.into());
        }
        Ok(())
    }

    /// Write the buffer's data at `position`; the cursor is unchanged
    pub fn write_at(
        &self,
        position: u64,
        buffer: AlignedBuffer,
        callback: Box<dyn IoCallback>,
    ) -> JournalResult<()> {
        let size = buffer.len();
        self.file.write(position, size, buffer, callback)?;
        Ok(())
    }

    /// Read a full buffer at the cursor and advance it by the buffer capacity
    pub fn read(&self, buffer: AlignedBuffer, callback: Box<dyn IoCallback>) -> JournalResult<()> {
        let size = buffer.capacity();
        let position = self.advance(size);
        if let Err(e) = self.file.read(position, size, buffer, callback) {
            self.rollback(position, size);
            return Err(e.into());
        }
        Ok(())
    }

    /// Read a full buffer at `position`; the cursor is unchanged
    pub fn read_at(
        &self,
        position: u64,
        buffer: AlignedBuffer,
        callback: Box<dyn IoCallback>,
    ) -> JournalResult<()> {
        let size = buffer.capacity();
        self.file.read(position, size, buffer, callback)?;
        Ok(())
    }

    /// Write at the cursor and wait for the write to complete
    pub fn write_blocking(&self, buffer: AlignedBuffer) -> JournalResult<()> {
        let waiter = WaitCallback::new();
        self.write(buffer, waiter.boxed())?;
        waiter.wait()?;
        Ok(())
    }

    /// Read at the cursor, wait, and return the bytes read
    ///
    /// The cursor advances by the number of bytes actually read.
    pub fn read_blocking(&self, buffer: AlignedBuffer) -> JournalResult<Vec<u8>> {
        let waiter = WaitCallback::capturing();
        let position = self.position();
        let size = buffer.capacity();
        self.file.read(position, size, buffer, waiter.boxed())?;
        waiter.wait()?;

        let data = waiter.take_data().unwrap_or_default();
        self.advance(data.len());
        Ok(data)
    }

    /// Preallocate `size` bytes of `fill_byte` starting at `position`
    ///
    /// The start is rounded up to the file alignment. Large regions are
    /// written in big blocks.
    pub fn fill(&self, position: u64, size: usize, fill_byte: u8) -> JournalResult<()> {
        if size == 0 {
            return Ok(());
        }
        let alignment = self.alignment();
        let block_size = Self::fill_block_size(size, alignment);
        let blocks = size.div_ceil(block_size);
        let start = self.calculate_block_start(position);

        tracing::debug!(
            file = %self.file_name,
            start,
            blocks,
            block_size,
            "Filling journal file"
        );
        self.file.fill(start, blocks, block_size, fill_byte)?;
        Ok(())
    }

    fn fill_block_size(size: usize, alignment: usize) -> usize {
        FILL_BLOCK_SIZES
            .into_iter()
            .find(|&block| size >= block && size.is_multiple_of(block))
            .unwrap_or(if alignment > 1 { alignment } else { size.max(1) })
    }

    /// Current file size in bytes
    pub fn size(&self) -> JournalResult<u64> {
        Ok(self.file.size()?)
    }

    pub fn sync(&self) -> JournalResult<()> {
        Ok(self.file.sync()?)
    }

    /// Close the file after its pending operations complete
    pub fn close(&self) -> JournalResult<()> {
        Ok(self.file.close()?)
    }

    /// Close if open and remove the file
    pub fn delete(&self) -> JournalResult<()> {
        if self.is_open() {
            self.close()?;
        }
        if self.exists() {
            std::fs::remove_file(self.path())?;
        }
        Ok(())
    }

    /// Close if open and rename within the journal directory
    pub fn rename_to(&mut self, new_name: &str) -> JournalResult<()> {
        super::factory::validate_file_name(new_name)?;
        if self.is_open() {
            self.close()?;
        }
        std::fs::rename(self.path(), self.directory.join(new_name))?;
        self.file_name = new_name.to_string();
        Ok(())
    }

    /// Target notified once an operation no longer needs its buffer
    pub fn set_buffer_callback(&self, callback: Option<Arc<dyn BufferCallback>>) {
        self.file.set_buffer_callback(callback);
    }

    pub fn stats(&self) -> &IoStats {
        self.file.stats()
    }
}
