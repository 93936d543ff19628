#![forbid(unsafe_code)]
//! Read-only block I/O for APFS container images.
//!
//! Provides the `BlockSource` trait the resolution engine reads through,
//! plus byte-addressed devices (file and in-memory) and the adapter that
//! turns one into a block source.

use apfs_error::{ApfsError, Result};
use apfs_types::{BlockSize, NX_MINIMUM_BLOCK_SIZE, Paddr};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length is a whole multiple of the originating source's block
/// size, except for buffers returned by [`BlockSource::read_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

impl AsRef<[u8]> for BlockBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| ApfsError::Format("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| ApfsError::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(ApfsError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positioned reads.
///
/// `FileExt::read_exact_at` is thread-safe and does not share a seek
/// position, so one device can serve concurrent resolvers.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// Immutable in-memory image, shared cheaply between clones.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| ApfsError::Format("offset does not fit usize".to_owned()))?;
        let end = start + buf.len();
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// Block-addressed, read-only storage the resolution engine consumes.
///
/// Implementations must be safe for concurrent reads; the engine never
/// holds a lock across a call into the source.
pub trait BlockSource: Send + Sync {
    /// Container block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read one block.
    fn read_block(&self, addr: Paddr) -> Result<BlockBuf>;

    /// Read `count` contiguous blocks starting at `start`.
    fn read_block_range(&self, start: Paddr, count: u32) -> Result<BlockBuf> {
        let mut out = Vec::new();
        for i in 0..u64::from(count) {
            let addr = start.checked_add(i).ok_or(ApfsError::OutOfRange {
                block: start.0,
                block_count: self.block_count(),
            })?;
            out.extend_from_slice(self.read_block(addr)?.as_slice());
        }
        Ok(BlockBuf::new(out))
    }

    /// Read `len` bytes starting `offset` bytes into block `addr`.
    ///
    /// The range must stay inside that block.
    fn read_bytes(&self, addr: Paddr, offset: u32, len: u32) -> Result<Vec<u8>> {
        check_sub_block(addr, offset, len, self.block_size())?;
        let block = self.read_block(addr)?;
        let start = offset as usize;
        let end = start + len as usize;
        block
            .as_slice()
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ApfsError::TruncatedData {
                block: addr.0,
                detail: format!(
                    "block read returned {} bytes, wanted {start}..{end}",
                    block.len()
                ),
            })
    }
}

fn check_sub_block(addr: Paddr, offset: u32, len: u32, block_size: u32) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= block_size => Ok(()),
        _ => Err(ApfsError::TruncatedData {
            block: addr.0,
            detail: format!(
                "byte range {offset}+{len} exceeds block size {block_size}"
            ),
        }),
    }
}

impl<S: BlockSource + ?Sized> BlockSource for Arc<S> {
    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn read_block(&self, addr: Paddr) -> Result<BlockBuf> {
        (**self).read_block(addr)
    }

    fn read_block_range(&self, start: Paddr, count: u32) -> Result<BlockBuf> {
        (**self).read_block_range(start, count)
    }

    fn read_bytes(&self, addr: Paddr, offset: u32, len: u32) -> Result<Vec<u8>> {
        (**self).read_bytes(addr, offset, len)
    }
}

/// Adapts a [`ByteDevice`] into a [`BlockSource`] with a fixed block size.
#[derive(Debug)]
pub struct ByteBlockSource<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockSource<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size.get());
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(ApfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        trace!(block_size = block_size.get(), block_count, "block_source_open");
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn check_blocks(&self, start: Paddr, count: u64) -> Result<u64> {
        let in_range = start
            .0
            .checked_add(count)
            .is_some_and(|end| end <= self.block_count);
        if !in_range {
            return Err(ApfsError::OutOfRange {
                block: start.0,
                block_count: self.block_count,
            });
        }
        self.block_size
            .block_to_byte(start)
            .ok_or(ApfsError::OutOfRange {
                block: start.0,
                block_count: self.block_count,
            })
    }
}

impl<D: ByteDevice> BlockSource for ByteBlockSource<D> {
    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, addr: Paddr) -> Result<BlockBuf> {
        let offset = self.check_blocks(addr, 1)?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn read_block_range(&self, start: Paddr, count: u32) -> Result<BlockBuf> {
        let offset = self.check_blocks(start, u64::from(count))?;
        let len = self
            .block_size
            .as_usize()
            .checked_mul(count as usize)
            .ok_or_else(|| ApfsError::Format("block range length overflow".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn read_bytes(&self, addr: Paddr, offset: u32, len: u32) -> Result<Vec<u8>> {
        check_sub_block(addr, offset, len, self.block_size.get())?;
        let base = self.check_blocks(addr, 1)?;
        let mut buf = vec![0_u8; len as usize];
        self.inner.read_exact_at(base + u64::from(offset), &mut buf)?;
        Ok(buf)
    }
}

/// Read the container superblock region (the smallest legal block at offset 0).
///
/// Used to sniff the real block size before a [`ByteBlockSource`] exists.
pub fn read_container_superblock_region(
    dev: &dyn ByteDevice,
) -> Result<[u8; NX_MINIMUM_BLOCK_SIZE as usize]> {
    let mut buf = [0_u8; NX_MINIMUM_BLOCK_SIZE as usize];
    dev.read_exact_at(0, &mut buf)?;
    Ok(buf)
}
