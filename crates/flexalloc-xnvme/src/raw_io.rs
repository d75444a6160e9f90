//! File-backed namespace and aligned buffers
//!
//! Presents a regular file or a block device as a conventional namespace:
//! - Linux: O_DIRECT flag when direct I/O is requested
//! - macOS: F_NOCACHE fcntl when direct I/O is requested

use crate::device::{Geometry, NvmCommand, NvmeDevice};
use crate::queue::EmulatedQueue;
use flexalloc_common::config::DeviceConfig;
use flexalloc_common::{CplStatus, Error, Result, SubmitError};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Default alignment for direct I/O buffers
pub const ALIGNMENT: usize = 4096;

/// Zeroed, heap-allocated buffer with a guaranteed start alignment
///
/// Direct I/O requires the memory, the file offset and the length to be
/// aligned to the logical block size. Buffers handed out by
/// [`NvmeDevice::alloc_buf`] satisfy the first and the last.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer uniquely owns its allocation
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a buffer aligned to [`ALIGNMENT`]
    pub fn new(size: usize) -> Result<Self> {
        Self::try_with_alignment(size, ALIGNMENT)
    }

    /// Create a buffer of at least `size` bytes aligned to `alignment`
    ///
    /// The length is rounded up to a multiple of `alignment`.
    pub fn try_with_alignment(size: usize, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::validation(format!(
                "buffer alignment {alignment} is not a power of two"
            )));
        }
        let len = size
            .checked_next_multiple_of(alignment)
            .ok_or_else(|| Error::resource(format!("buffer of {size} bytes is too large")))?;
        // Zero-sized allocations are not allowed; an empty buffer still owns one unit
        let layout = Layout::from_size_align(len.max(alignment), alignment)
            .map_err(|e| Error::resource(format!("invalid buffer layout: {e}")))?;

        #[allow(unsafe_code)]
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::resource(format!("failed to allocate {len} bytes aligned to {alignment}"))
        })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn as_slice(&self) -> &[u8] {
        self
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Grow or shrink to at least `size` bytes, keeping the alignment
    ///
    /// The leading `min(old, new)` bytes are preserved and any growth is
    /// zeroed. On failure the buffer is left untouched.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        let mut resized = Self::try_with_alignment(size, self.alignment())?;
        let keep = self.len.min(resized.len);
        resized[..keep].copy_from_slice(&self[..keep]);
        *self = resized;
        Ok(())
    }

    /// Copy data into the buffer (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let copy_len = src.len().min(self.len);
        self[..copy_len].copy_from_slice(&src[..copy_len]);
        self[copy_len..].fill(0);
    }
}

#[allow(unsafe_code)]
impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

#[allow(unsafe_code)]
impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Conventional namespace backed by a file or block device
pub struct FileDevice {
    file: File,
    path: PathBuf,
    geo: Geometry,
    direct_io: bool,
}

impl FileDevice {
    /// Open an existing file or block device
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let is_block_device = is_block_device(&config.path);
        let file = open_options(config.direct_io)
            .open(&config.path)
            .map_err(|e| io_context(e, "open", &config.path))?;
        set_nocache(&file, config.direct_io, &config.path)?;

        let size = if is_block_device {
            block_device_size(&file, &config.path)?
        } else {
            file.metadata()
                .map_err(|e| io_context(e, "stat", &config.path))?
                .len()
        };
        Self::finish(file, config, size)
    }

    /// Create or truncate a regular file of `config.size` bytes
    ///
    /// Block devices are opened as-is and keep their own size.
    pub fn create(config: &DeviceConfig) -> Result<Self> {
        let is_block_device = is_block_device(&config.path);
        let mut options = open_options(config.direct_io);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        let file = options
            .open(&config.path)
            .map_err(|e| io_context(e, "create", &config.path))?;
        set_nocache(&file, config.direct_io, &config.path)?;

        let size = if is_block_device {
            block_device_size(&file, &config.path)?
        } else {
            file.set_len(config.size)
                .map_err(|e| io_context(e, "resize", &config.path))?;
            config.size
        };
        Self::finish(file, config, size)
    }

    fn finish(file: File, config: &DeviceConfig, size: u64) -> Result<Self> {
        let lba = u64::from(config.lba_nbytes);
        if lba == 0 || size < lba {
            return Err(Error::geometry(format!(
                "{} holds {size} bytes, less than one {lba}-byte block",
                config.path.display()
            )));
        }
        let geo = Geometry::conventional(config.lba_nbytes, size - size % lba, config.mdts_nbytes);
        debug!(
            path = %config.path.display(),
            tbytes = geo.tbytes,
            lba_nbytes = geo.lba_nbytes,
            direct_io = config.direct_io,
            "file device opened"
        );
        Ok(Self {
            file,
            path: config.path.clone(),
            geo,
            direct_io: config.direct_io,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written data to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| io_context(e, "sync", &self.path))
    }

    fn needs_bounce(&self, buf: &[u8]) -> bool {
        self.direct_io && buf.as_ptr() as usize % self.geo.lba_nbytes as usize != 0
    }

    fn read_blocks(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        if self.needs_bounce(buf) {
            let mut bounce = self.bounce(buf.len())?;
            self.file.read_exact_at(&mut bounce, offset)?;
            buf.copy_from_slice(&bounce);
            return Ok(());
        }
        self.file.read_exact_at(buf, offset)
    }

    fn write_blocks(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        if self.needs_bounce(buf) {
            let mut bounce = self.bounce(buf.len())?;
            bounce.copy_from(buf);
            return self.file.write_all_at(&bounce, offset);
        }
        self.file.write_all_at(buf, offset)
    }

    fn bounce(&self, nbytes: usize) -> std::io::Result<AlignedBuffer> {
        self.alloc_buf(nbytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::OutOfMemory, e.to_string()))
    }

    fn run(&self, cmd: NvmCommand<'_>) -> std::io::Result<CplStatus> {
        let lba = self.geo.lba_nbytes as usize;
        let Some(nlb) = cmd.nlb() else {
            return Ok(CplStatus::INVALID_OPCODE);
        };
        let in_range = cmd
            .slba()
            .checked_add(u64::from(nlb) + 1)
            .is_some_and(|end| end <= self.geo.nlbas());
        if !in_range {
            return Ok(CplStatus::LBA_OUT_OF_RANGE);
        }
        let nbytes = (usize::from(nlb) + 1) * lba;
        let offset = cmd.slba() * lba as u64;

        match cmd {
            NvmCommand::Read { buf, .. } => {
                let Some(buf) = buf.get_mut(..nbytes) else {
                    return Ok(CplStatus::INVALID_FIELD);
                };
                self.read_blocks(offset, buf)?;
            }
            NvmCommand::Write { buf, .. } => {
                let Some(buf) = buf.get(..nbytes) else {
                    return Ok(CplStatus::INVALID_FIELD);
                };
                self.write_blocks(offset, buf)?;
            }
            NvmCommand::WriteZeroes { .. } => {
                let zeroes = self.bounce(nbytes)?;
                self.file.write_all_at(&zeroes, offset)?;
            }
            NvmCommand::ZoneMgmtSend { .. } => return Ok(CplStatus::INVALID_OPCODE),
        }
        Ok(CplStatus::SUCCESS)
    }
}

impl NvmeDevice for FileDevice {
    type Queue<'a> = EmulatedQueue<'a, Self>;

    fn geometry(&self) -> &Geometry {
        &self.geo
    }

    fn execute(&self, cmd: NvmCommand<'_>) -> std::result::Result<CplStatus, SubmitError> {
        let (op, slba) = (cmd.opcode(), cmd.slba());
        match self.run(cmd) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(path = %self.path.display(), %op, slba, "file device I/O failed: {}", e);
                Ok(CplStatus::INTERNAL_ERROR)
            }
        }
    }

    fn queue_init<'a>(&'a self, capacity: u32) -> Result<Self::Queue<'a>> {
        EmulatedQueue::new(self, capacity)
    }
}

fn open_options(direct_io: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true);

    // O_DIRECT bypasses page cache on Linux
    #[cfg(target_os = "linux")]
    if direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = direct_io;

    options
}

#[cfg(target_os = "macos")]
fn set_nocache(file: &File, direct_io: bool, path: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    if !direct_io {
        return Ok(());
    }
    #[allow(unsafe_code)]
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(io_context(std::io::Error::last_os_error(), "set F_NOCACHE on", path));
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
#[allow(clippy::unnecessary_wraps)]
const fn set_nocache(_file: &File, _direct_io: bool, _path: &Path) -> Result<()> {
    Ok(())
}

fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    // A missing path will be created as a regular file
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    let mut size: u64 = 0;
    let ret = unsafe { blkgetsize64(file.as_raw_fd(), &mut size) };
    ret.map_err(|errno| io_context(errno.into(), "query size of", path))?;
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    use std::io::{Seek, SeekFrom};

    let mut f = file;
    let size = f
        .seek(SeekFrom::End(0))
        .map_err(|e| io_context(e, "query size of", path))?;
    f.seek(SeekFrom::Start(0))
        .map_err(|e| io_context(e, "seek", path))?;
    Ok(size)
}

fn io_context(e: std::io::Error, what: &str, path: &Path) -> Error {
    Error::DiskIo(std::io::Error::new(
        e.kind(),
        format!("failed to {what} {}: {e}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::LbaRange;
    use crate::seq;
    use crate::stripe::StripeParams;
    use crate::striped::StripeEngine;
    use flexalloc_common::Direction;
    use rand::RngCore;
    use tempfile::TempDir;

    fn config(dir: &TempDir, size: u64) -> DeviceConfig {
        DeviceConfig {
            path: dir.path().join("dev.img"),
            size,
            lba_nbytes: 4096,
            mdts_nbytes: 16 * 1024,
            direct_io: false,
        }
    }

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        assert!(buf.iter().all(|&b| b == 0));

        buf.copy_from(b"hello");
        assert_eq!(&buf[..5], b"hello");

        let buf = AlignedBuffer::try_with_alignment(512, 512).unwrap();
        assert_eq!(buf.len(), 512);
        assert_eq!(buf.alignment(), 512);

        assert!(AlignedBuffer::try_with_alignment(512, 1000).is_err());
        assert!(AlignedBuffer::new(0).unwrap().is_empty());
    }

    #[test]
    fn test_resize_keeps_contents_and_alignment() {
        let mut buf = AlignedBuffer::try_with_alignment(1024, 512).unwrap();
        buf.iter_mut().enumerate().for_each(|(i, b)| *b = (i % 251) as u8);
        let before = buf.to_vec();

        buf.resize(3000).unwrap();
        assert_eq!(buf.len(), 3072);
        assert_eq!(buf.alignment(), 512);
        assert_eq!(buf.as_ptr() as usize % 512, 0);
        assert_eq!(&buf[..1024], before.as_slice());
        assert!(buf[1024..].iter().all(|&b| b == 0));

        buf.resize(512).unwrap();
        assert_eq!(buf.len(), 512);
        assert_eq!(&buf[..], &before[..512]);

        buf.resize(0).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 1 << 20);

        let mut data = vec![0u8; 3 * 4096];
        rand::thread_rng().fill_bytes(&mut data);

        {
            let dev = FileDevice::create(&config).unwrap();
            assert_eq!(dev.geometry().nlbas(), 256);
            let status = dev
                .execute(NvmCommand::Write {
                    slba: 10,
                    nlb: 2,
                    buf: &data,
                })
                .unwrap();
            assert!(status.is_success());
            dev.sync().unwrap();
        }

        let dev = FileDevice::open(&config).unwrap();
        assert_eq!(dev.path(), config.path.as_path());
        let mut out = dev.alloc_buf(data.len()).unwrap();
        let status = dev
            .execute(NvmCommand::Read {
                slba: 10,
                nlb: 2,
                buf: &mut out,
            })
            .unwrap();
        assert!(status.is_success());
        assert_eq!(out.as_slice(), data.as_slice());
    }

    #[test]
    fn test_command_statuses() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&config(&dir, 64 * 4096)).unwrap();
        let buf = vec![0u8; 4096];

        let status = dev
            .execute(NvmCommand::Write {
                slba: 64,
                nlb: 0,
                buf: &buf,
            })
            .unwrap();
        assert_eq!(status, CplStatus::LBA_OUT_OF_RANGE);

        let status = dev
            .execute(NvmCommand::Write {
                slba: 0,
                nlb: 1,
                buf: &buf,
            })
            .unwrap();
        assert_eq!(status, CplStatus::INVALID_FIELD);

        let status = dev
            .execute(NvmCommand::ZoneMgmtSend {
                slba: 0,
                action: flexalloc_common::ZoneAction::Reset,
                all: true,
            })
            .unwrap();
        assert_eq!(status, CplStatus::INVALID_OPCODE);
    }

    #[test]
    fn test_end_past_u64_is_out_of_range() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&config(&dir, 64 * 4096)).unwrap();
        let mut buf = vec![0u8; 2 * 4096];

        let status = dev
            .execute(NvmCommand::Write {
                slba: u64::MAX,
                nlb: 0,
                buf: &buf,
            })
            .unwrap();
        assert_eq!(status, CplStatus::LBA_OUT_OF_RANGE);

        let status = dev
            .execute(NvmCommand::Read {
                slba: u64::MAX - 1,
                nlb: 1,
                buf: &mut buf,
            })
            .unwrap();
        assert_eq!(status, CplStatus::LBA_OUT_OF_RANGE);

        let status = dev
            .execute(NvmCommand::WriteZeroes {
                slba: u64::MAX,
                nlb: u16::MAX,
            })
            .unwrap();
        assert_eq!(status, CplStatus::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn test_misaligned_buffer_bounces_under_direct_io() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 64 * 4096);
        config.direct_io = true;
        // tmpfs and some overlay filesystems refuse O_DIRECT
        let Ok(dev) = FileDevice::create(&config) else {
            return;
        };
        let aligned = dev.alloc_buf(4096).unwrap();
        let status = dev
            .execute(NvmCommand::Write {
                slba: 0,
                nlb: 0,
                buf: &aligned,
            })
            .unwrap();
        if !status.is_success() {
            return;
        }

        // One byte past an aligned start is never block aligned
        let mut backing = dev.alloc_buf(3 * 4096).unwrap();
        rand::thread_rng().fill_bytes(&mut backing);
        let data = backing[1..1 + 2 * 4096].to_vec();
        assert!(dev.needs_bounce(&backing[1..]));
        let status = dev
            .execute(NvmCommand::Write {
                slba: 4,
                nlb: 1,
                buf: &backing[1..],
            })
            .unwrap();
        assert!(status.is_success());

        backing.fill(0);
        let status = dev
            .execute(NvmCommand::Read {
                slba: 4,
                nlb: 1,
                buf: &mut backing[1..],
            })
            .unwrap();
        assert!(status.is_success());
        assert_eq!(&backing[1..1 + 2 * 4096], data.as_slice());
        assert!(backing[1 + 2 * 4096..].iter().all(|&b| b == 0));

        let mut out = dev.alloc_buf(2 * 4096).unwrap();
        assert!(!dev.needs_bounce(&out));
        seq::read_blocks(&dev, 4, 2, &mut out).unwrap();
        assert_eq!(out.as_slice(), data.as_slice());
    }

    #[test]
    fn test_buffered_io_never_bounces() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&config(&dir, 64 * 4096)).unwrap();
        let backing = dev.alloc_buf(2 * 4096).unwrap();
        assert!(!dev.needs_bounce(&backing[1..]));
    }

    #[test]
    fn test_striped_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&config(&dir, 64 * 4096)).unwrap();

        // Four 16-block members fill the file; two-block chunks
        let sp = StripeParams {
            xfer_nbytes: 64 * 4096,
            xfer_snbytes: 0,
            chunk_nbytes: 2 * 4096,
            width: 4,
            obj_nlbs: 16,
            obj_start_nbytes: 0,
            lba_nbytes: 4096,
            direction: Direction::Write,
        };
        let mut data = dev.alloc_buf(64 * 4096).unwrap();
        rand::thread_rng().fill_bytes(&mut data);

        let engine = StripeEngine::new(&dev);
        let report = engine.write(&data, &sp).unwrap();
        assert_eq!(report.commands(), 32);
        assert_eq!(report.members.len(), 4);

        // Chunk 1 opens member 1, chunk 4 is member 0's second chunk
        let mut chunk = vec![0u8; 2 * 4096];
        seq::read_blocks(&dev, 16, 2, &mut chunk).unwrap();
        assert_eq!(chunk, data[2 * 4096..4 * 4096]);
        seq::read_blocks(&dev, 2, 2, &mut chunk).unwrap();
        assert_eq!(chunk, data[8 * 4096..10 * 4096]);

        let read_sp = StripeParams {
            direction: Direction::Read,
            ..sp
        };
        let mut out = dev.alloc_buf(64 * 4096).unwrap();
        engine.read(&mut out, &read_sp).unwrap();
        assert_eq!(out.as_slice(), data.as_slice());
    }

    #[test]
    fn test_sequential_through_file() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&config(&dir, 64 * 4096)).unwrap();

        // 10 blocks with a 4-block transfer limit
        let range = LbaRange::from_slba_naddrs(dev.geometry(), 5, 10);
        let mut data = vec![0u8; 10 * 4096];
        rand::thread_rng().fill_bytes(&mut data);
        seq::write_range(&dev, &range, &data).unwrap();

        let mut out = vec![0u8; data.len()];
        seq::read_range(&dev, &range, &mut out).unwrap();
        assert_eq!(out, data);

        seq::write_zeroes_range(&dev, &range).unwrap();
        seq::read_range(&dev, &range, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_too_small_for_one_block() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileDevice::create(&config(&dir, 100)),
            Err(Error::Geometry(_))
        ));
    }
}
