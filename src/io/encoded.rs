//! Writing Zstandard frames into output files.
//!
//! On btrfs a frame can be handed to the kernel as-is with
//! `BTRFS_IOC_ENCODED_WRITE`, which stores the compressed extent without
//! decompressing it in user space. Everywhere else, and whenever the kernel
//! refuses, the frame is decompressed into a scratch buffer and written with
//! a positioned write.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{BurstError, Result};
use crate::metrics::{Metrics, NoopMetrics};
use crate::zip::MAX_EXTENT_SIZE;

/// Destination for decoded entry data. One instance per worker; not shared.
pub trait FrameWriter: Send {
    /// Write the content of one Zstandard frame at `offset` of `file`.
    ///
    /// `uncompressed_len` is the frame's declared content size.
    fn write_frame(&mut self, file: &File, frame: &[u8], uncompressed_len: u64, offset: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodedSupport {
    Unknown,
    Enabled,
    Disabled,
}

/// [`FrameWriter`] using btrfs encoded writes with a decompressing fallback.
pub struct EncodedFrameWriter {
    decompressor: zstd::bulk::Decompressor<'static>,
    scratch: Vec<u8>,
    encoded: EncodedSupport,
    metrics: Arc<dyn Metrics>,
}

impl EncodedFrameWriter {
    pub fn new() -> Result<Self> {
        let decompressor = zstd::bulk::Decompressor::new()
            .map_err(|e| BurstError::io("create Zstandard decompressor", e))?;
        Ok(Self {
            decompressor,
            scratch: vec![0u8; MAX_EXTENT_SIZE],
            encoded: EncodedSupport::Unknown,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn encoded_enabled(&mut self, file: &File) -> bool {
        if self.encoded == EncodedSupport::Unknown {
            self.encoded = if sys::is_btrfs(file) {
                debug!("output is on btrfs, using encoded writes");
                EncodedSupport::Enabled
            } else {
                EncodedSupport::Disabled
            };
        }
        self.encoded == EncodedSupport::Enabled
    }

    fn write_unencoded(&mut self, file: &File, frame: &[u8], uncompressed_len: u64, offset: u64) -> Result<()> {
        let started = Instant::now();
        let n = self
            .decompressor
            .decompress_to_buffer(frame, &mut self.scratch[..])
            .map_err(|e| BurstError::WriteBackendError(format!("decompress frame: {e}")))?;
        if n as u64 != uncompressed_len {
            return Err(BurstError::WriteBackendError(format!(
                "frame declared {uncompressed_len} bytes but decompressed to {n}"
            )));
        }
        file.write_all_at(&self.scratch[..n], offset)
            .map_err(|e| BurstError::io(format!("write {n} bytes at offset {offset}"), e))?;
        self.metrics.record_unencoded_write(n as u64, started.elapsed());
        Ok(())
    }
}

impl FrameWriter for EncodedFrameWriter {
    fn write_frame(&mut self, file: &File, frame: &[u8], uncompressed_len: u64, offset: u64) -> Result<()> {
        if uncompressed_len > MAX_EXTENT_SIZE as u64 {
            return Err(BurstError::WriteBackendError(format!(
                "frame of {uncompressed_len} bytes exceeds the {MAX_EXTENT_SIZE}-byte extent limit"
            )));
        }
        if uncompressed_len == 0 {
            return Ok(());
        }

        // The kernel only accepts extents that actually save space.
        if (frame.len() as u64) < uncompressed_len && self.encoded_enabled(file) {
            let started = Instant::now();
            match sys::encoded_write(file, frame, uncompressed_len, offset) {
                Ok(()) => {
                    self.metrics.record_encoded_write(frame.len() as u64, started.elapsed());
                    return Ok(());
                }
                Err(e) if sys::needs_fallback(&e) => {
                    warn!(error = %e, "encoded write unavailable, decompressing in user space");
                    self.encoded = EncodedSupport::Disabled;
                }
                Err(e) => {
                    return Err(BurstError::WriteBackendError(format!(
                        "encoded write of {} bytes at offset {offset}: {e}",
                        frame.len()
                    )));
                }
            }
        }

        self.write_unencoded(file, frame, uncompressed_len, offset)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;
    const BTRFS_ENCODED_IO_COMPRESSION_ZSTD: u32 = 2;
    /// `_IOW(0x94, 64, struct btrfs_ioctl_encoded_io_args)`
    const BTRFS_IOC_ENCODED_WRITE: u64 = 0x4080_9440;

    #[repr(C)]
    struct EncodedIoArgs {
        iov: *const libc::iovec,
        iovcnt: libc::c_ulong,
        offset: i64,
        flags: u64,
        len: u64,
        unencoded_len: u64,
        unencoded_offset: u64,
        compression: u32,
        encryption: u32,
        reserved: [u8; 64],
    }

    const _: () = assert!(std::mem::size_of::<EncodedIoArgs>() == 128);

    pub fn is_btrfs(file: &File) -> bool {
        let mut stat = std::mem::MaybeUninit::<libc::statfs>::zeroed();
        // SAFETY: fstatfs fills the struct on success; the fd is open for the
        // lifetime of `file`.
        let rc = unsafe { libc::fstatfs(file.as_raw_fd(), stat.as_mut_ptr()) };
        if rc != 0 {
            return false;
        }
        // SAFETY: initialised by the successful call above.
        let stat = unsafe { stat.assume_init() };
        stat.f_type as i64 == BTRFS_SUPER_MAGIC
    }

    pub fn encoded_write(file: &File, frame: &[u8], uncompressed_len: u64, offset: u64) -> io::Result<()> {
        let iov = libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        let args = EncodedIoArgs {
            iov: &iov,
            iovcnt: 1,
            offset: offset as i64,
            flags: 0,
            len: uncompressed_len,
            unencoded_len: uncompressed_len,
            unencoded_offset: 0,
            compression: BTRFS_ENCODED_IO_COMPRESSION_ZSTD,
            encryption: 0,
            reserved: [0; 64],
        };
        // SAFETY: `args` and the iovec it points to outlive the call, and the
        // kernel only reads `frame.len()` bytes from the buffer.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                BTRFS_IOC_ENCODED_WRITE as _,
                &args as *const EncodedIoArgs,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Errors meaning "this filesystem or process cannot do encoded writes".
    pub fn needs_fallback(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::ENOTTY | libc::EOPNOTSUPP | libc::EPERM | libc::EINVAL)
        )
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn is_btrfs(_file: &File) -> bool {
        false
    }

    pub fn encoded_write(_file: &File, _frame: &[u8], _uncompressed_len: u64, _offset: u64) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub fn needs_fallback(_err: &io::Error) -> bool {
        true
    }
}
