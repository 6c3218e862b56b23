//! io_uring backend for Linux
//!
//! One ring per open file, sized for the file's `max_io`. Submitting threads
//! push entries under a short lock; the completion poller is the only reader
//! of the completion queue and blocks in `submit_and_wait`. Stopping the
//! poller submits a NOP tagged with [`STOP_TOKEN`].

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use io_uring::{opcode, types, IoUring, Probe};
use parking_lot::Mutex;

use super::{Backend, BackendFactory, IoRequest, OpKind, PollOutcome, RawCompletion, SubmitError};
use crate::io::aligned_buffer::{AlignedBuffer, BLOCK_SIZE};
use crate::io::error::{ErrorCode, IoError, IoResult};

/// User data of the NOP that wakes and stops the poller
const STOP_TOKEN: u64 = u64::MAX;

/// Largest ring the kernel accepts without clamping
pub const MAX_RING_ENTRIES: usize = 32768;

/// Largest transfer a single READ/WRITE entry can describe
const MAX_TRANSFER: usize = u32::MAX as usize;

/// Minimum kernel version for the opcodes used here (5.6)
const MIN_KERNEL_VERSION: (u32, u32) = (5, 6);

struct InFlight {
    kind: OpKind,
    len: usize,
    buffer: AlignedBuffer,
}

/// io_uring-based backend for one file
pub struct UringBackend {
    // Declared first so the ring is torn down before the buffers it may reference
    ring: IoUring,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    submit_lock: Mutex<()>,
    file: File,
    direct: bool,
}

impl UringBackend {
    /// Open a file with a ring deep enough for `max_io` operations
    pub fn open(path: &Path, max_io: usize, direct_io: bool) -> IoResult<Self> {
        if max_io == 0 || max_io >= MAX_RING_ENTRIES {
            return Err(IoError::BackendInit {
                code: ErrorCode::CannotInitializeBackend,
                message: format!(
                    "max_io {} outside supported range 1..{}",
                    max_io, MAX_RING_ENTRIES
                ),
            });
        }

        // One extra entry for the stop NOP
        let entries = (max_io + 1).next_power_of_two() as u32;
        let ring = IoUring::new(entries).map_err(|e| IoError::BackendInit {
            code: ErrorCode::CannotInitializeBackend,
            message: format!("io_uring setup with {} entries failed: {}", entries, e),
        })?;

        let (file, direct) = Self::open_file(path, direct_io)?;

        Ok(Self {
            ring,
            in_flight: Mutex::new(HashMap::with_capacity(max_io)),
            submit_lock: Mutex::new(()),
            file,
            direct,
        })
    }

    fn open_file(path: &Path, direct_io: bool) -> IoResult<(File, bool)> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);

        if direct_io {
            let mut direct = opts.clone();
            direct.custom_flags(libc::O_DIRECT);
            match direct.open(path) {
                Ok(file) => return Ok((file, true)),
                // tmpfs and some other filesystems refuse O_DIRECT
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    tracing::debug!(
                        path = %path.display(),
                        "Filesystem does not support direct IO, using buffered IO"
                    );
                }
                Err(e) => return Err(Self::open_error(path, e)),
            }
        }

        let file = opts.open(path).map_err(|e| Self::open_error(path, e))?;
        Ok((file, false))
    }

    fn open_error(path: &Path, err: std::io::Error) -> IoError {
        IoError::BackendInit {
            code: ErrorCode::CannotOpenCloseFile,
            message: format!("{}: {}", path.display(), err),
        }
    }

    /// Whether the file was opened with O_DIRECT
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    fn check_alignment(&self, buf: &AlignedBuffer, offset: u64, len: usize) -> IoResult<()> {
        if len > MAX_TRANSFER {
            return Err(IoError::BufferSize {
                size: len,
                alignment: MAX_TRANSFER,
            });
        }

        if len > buf.capacity() {
            return Err(IoError::BufferSize {
                size: len,
                alignment: buf.capacity(),
            });
        }

        if !self.direct {
            return Ok(());
        }

        // Check buffer pointer alignment
        if !(buf.as_ptr() as usize).is_multiple_of(BLOCK_SIZE) {
            return Err(IoError::Alignment {
                expected: BLOCK_SIZE,
                actual: buf.as_ptr() as usize % BLOCK_SIZE,
            });
        }

        // Check offset alignment
        if !offset.is_multiple_of(BLOCK_SIZE as u64) {
            return Err(IoError::OffsetAlignment {
                offset,
                alignment: BLOCK_SIZE,
            });
        }

        if !len.is_multiple_of(BLOCK_SIZE) {
            return Err(IoError::BufferSize {
                size: len,
                alignment: BLOCK_SIZE,
            });
        }

        Ok(())
    }

    fn completion_result(record: &mut InFlight, res: i32) -> IoResult<usize> {
        if res < 0 {
            return Err(IoError::backend(
                ErrorCode::IoError,
                std::io::Error::from_raw_os_error(-res),
            ));
        }

        let transferred = res as usize;
        match record.kind {
            OpKind::Read => {
                record.buffer.set_len(transferred);
                Ok(transferred)
            }
            OpKind::Write if transferred < record.len => Err(IoError::Backend {
                code: ErrorCode::IoError,
                message: format!("short write: {} of {} bytes", transferred, record.len),
            }),
            OpKind::Write => Ok(transferred),
        }
    }
}

impl Backend for UringBackend {
    fn submit(&self, request: IoRequest) -> Result<(), SubmitError> {
        let IoRequest {
            id,
            kind,
            position,
            len,
            mut buffer,
        } = request;

        if let Err(error) = self.check_alignment(&buffer, position, len) {
            return Err(SubmitError { error, buffer });
        }

        let fd = types::Fd(self.file.as_raw_fd());
        let entry = match kind {
            OpKind::Write => opcode::Write::new(fd, buffer.as_ptr(), len as u32)
                .offset(position)
                .build()
                .user_data(id),
            OpKind::Read => opcode::Read::new(fd, buffer.as_mut_ptr(), len as u32)
                .offset(position)
                .build()
                .user_data(id),
        };

        let _guard = self.submit_lock.lock();

        // The heap allocation behind the buffer does not move when the
        // buffer is moved into the map, so the pointer in `entry` stays valid
        self.in_flight
            .lock()
            .insert(id, InFlight { kind, len, buffer });

        // SAFETY: This unsafe block is sound because:
        // 1. The buffer stays in `in_flight` until the poller reaps its completion
        // 2. `submit_lock` makes this the only live submission queue handle
        // 3. The poller never touches the submission queue directly
        let pushed = unsafe {
            let mut sq = self.ring.submission_shared();
            sq.push(&entry)
        };

        if pushed.is_err() {
            return match self.in_flight.lock().remove(&id) {
                Some(record) => Err(SubmitError {
                    error: IoError::Backend {
                        code: ErrorCode::BackendQueueFull,
                        message: "io_uring submission queue full".to_string(),
                    },
                    buffer: record.buffer,
                }),
                None => Ok(()),
            };
        }

        if let Err(e) = self.ring.submit() {
            // The entry stays queued; the poller's next enter flushes it
            tracing::debug!(error = %e, "io_uring submit deferred to poller");
        }

        Ok(())
    }

    fn poll(&self, completions: &mut Vec<RawCompletion>) -> IoResult<PollOutcome> {
        if let Err(e) = self.ring.submit_and_wait(1) {
            match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => {}
                _ => return Err(IoError::backend(ErrorCode::NativeErrorInternal, e)),
            }
        }

        let mut stopped = false;

        // SAFETY: the poller thread is the only consumer of the completion queue
        let cq = unsafe { self.ring.completion_shared() };
        for cqe in cq {
            let id = cqe.user_data();
            if id == STOP_TOKEN {
                stopped = true;
                continue;
            }

            let Some(mut record) = self.in_flight.lock().remove(&id) else {
                tracing::warn!(id, "io_uring completion for unknown operation");
                continue;
            };

            let result = Self::completion_result(&mut record, cqe.result());
            completions.push(RawCompletion {
                id,
                result,
                buffer: record.buffer,
            });
        }

        if stopped {
            Ok(PollOutcome::Stopped)
        } else {
            Ok(PollOutcome::Completed)
        }
    }

    fn stop_poller(&self) -> IoResult<()> {
        let nop = opcode::Nop::new().build().user_data(STOP_TOKEN);

        let _guard = self.submit_lock.lock();

        // SAFETY: NOP references no memory; `submit_lock` is held
        let pushed = unsafe {
            let mut sq = self.ring.submission_shared();
            sq.push(&nop)
        };
        if pushed.is_err() {
            return Err(IoError::Backend {
                code: ErrorCode::BackendQueueFull,
                message: "io_uring submission queue full while stopping poller".to_string(),
            });
        }

        self.ring
            .submit()
            .map_err(|e| IoError::backend(ErrorCode::NativeErrorInternal, e))?;
        Ok(())
    }

    fn size(&self) -> IoResult<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| IoError::backend(ErrorCode::IoError, e))?;
        Ok(metadata.len())
    }

    fn fill(&self, position: u64, blocks: usize, block_size: usize, fill_byte: u8) -> IoResult<()> {
        let alignment = if self.direct { BLOCK_SIZE } else { 1 };
        if !position.is_multiple_of(alignment as u64) {
            return Err(IoError::OffsetAlignment {
                offset: position,
                alignment,
            });
        }
        if !block_size.is_multiple_of(alignment) {
            return Err(IoError::BufferSize {
                size: block_size,
                alignment,
            });
        }

        let mut block = AlignedBuffer::with_alignment(block_size, alignment)?;
        block.fill(fill_byte);

        for i in 0..blocks {
            self.file
                .write_all_at(&block.as_full_slice()[..block_size], position + (i * block_size) as u64)
                .map_err(|e| IoError::backend(ErrorCode::PreallocateFile, e))?;
        }
        Ok(())
    }

    fn sync(&self) -> IoResult<()> {
        self.file
            .sync_all()
            .map_err(|e| IoError::backend(ErrorCode::IoError, e))
    }
}

/// Factory for creating UringBackend instances
#[derive(Debug, Clone)]
pub struct UringBackendFactory {
    direct_io: bool,
}

impl UringBackendFactory {
    pub fn new(direct_io: bool) -> Self {
        Self { direct_io }
    }
}

impl Default for UringBackendFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BackendFactory for UringBackendFactory {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn alignment(&self) -> usize {
        if self.direct_io {
            BLOCK_SIZE
        } else {
            1
        }
    }

    fn open(&self, path: &Path, max_io: usize) -> IoResult<Box<dyn Backend>> {
        Ok(Box::new(UringBackend::open(path, max_io, self.direct_io)?))
    }
}

/// Parses kernel version from uname release string (e.g., "5.15.0-generic")
fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn kernel_release() -> Option<String> {
    // SAFETY: utsname is plain data and uname fills it in
    unsafe {
        let mut utsname: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut utsname) != 0 {
            return None;
        }
        let release = CStr::from_ptr(utsname.release.as_ptr());
        release.to_str().ok().map(String::from)
    }
}

/// Validate that io_uring can be used by this process
///
/// Checks the kernel version, that a ring can be created (seccomp may block
/// it) and that the kernel reports the opcodes this backend submits.
pub(crate) fn probe() -> Result<(), String> {
    let release = kernel_release().ok_or_else(|| "unable to read kernel release".to_string())?;
    let version = parse_kernel_version(&release)
        .ok_or_else(|| format!("unrecognized kernel release '{}'", release))?;
    if version < MIN_KERNEL_VERSION {
        tracing::warn!(
            %release,
            "Kernel is older than {}.{}, io_uring backend disabled",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1
        );
        return Err(format!("kernel {} is too old", release));
    }

    let ring = IoUring::new(4).map_err(|e| format!("io_uring setup failed: {}", e))?;
    let mut probe = Probe::new();
    ring.submitter()
        .register_probe(&mut probe)
        .map_err(|e| format!("io_uring probe failed: {}", e))?;

    for (code, name) in [
        (opcode::Read::CODE, "READ"),
        (opcode::Write::CODE, "WRITE"),
        (opcode::Nop::CODE, "NOP"),
    ] {
        if !probe.is_supported(code) {
            tracing::warn!(opcode = name, %release, "io_uring opcode not supported by kernel");
            return Err(format!("io_uring {} not supported", name));
        }
    }

    Ok(())
}
