//! # Block Reader
//!
//! Fetches raw page bytes by address. Two read modes:
//!
//! - **Mapped**: the file is memory-mapped once at open; reads return a
//!   range of the shared mapping with no copy. Page faults may block on
//!   disk I/O, which is the synchronous-blocking model this engine uses.
//! - **Owned**: reads copy the block into a fresh `Vec`. Used when the
//!   platform or file system cannot map, and by tools that outlive the
//!   reader.
//!
//! Every block carries a CRC-32 (iSCSI polynomial) in its address cookie;
//! a mismatch is a `Format` error, never silently served.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use memmap2::Mmap;

use crate::encoding::{decode_recno, encode_recno};
use crate::error::{Result, StoreError};

const BLOCK_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Address cookie for one on-disk block: file offset, byte size, and the
/// checksum of the stored bytes. Packed with the recno encoding so the
/// cookie is compact and self-delimiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAddr {
    pub offset: u64,
    pub size: u32,
    pub checksum: u32,
}

impl BlockAddr {
    pub fn pack(&self) -> Vec<u8> {
        let mut cookie = Vec::with_capacity(16);
        encode_recno(self.offset, &mut cookie);
        encode_recno(u64::from(self.size), &mut cookie);
        encode_recno(u64::from(self.checksum), &mut cookie);
        cookie
    }

    pub fn unpack(cookie: &[u8]) -> Result<Self> {
        let (offset, n1) = decode_recno(cookie)?;
        let (size, n2) = decode_recno(&cookie[n1..])?;
        let (checksum, n3) = decode_recno(&cookie[n1 + n2..])?;
        if n1 + n2 + n3 != cookie.len() {
            return Err(StoreError::format("trailing bytes in block address"));
        }
        let size = u32::try_from(size)
            .map_err(|_| StoreError::format("block size out of range"))?;
        let checksum = u32::try_from(checksum)
            .map_err(|_| StoreError::format("block checksum out of range"))?;
        Ok(Self {
            offset,
            size,
            checksum,
        })
    }
}

/// A page's raw bytes: owned allocation or a borrowed range of a shared
/// mapping. The page image takes ownership of this buffer on success.
#[derive(Debug, Clone)]
pub enum DiskBytes {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl DiskBytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            DiskBytes::Owned(bytes) => bytes,
            DiskBytes::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DiskBytes::Owned(bytes) => bytes.len(),
            DiskBytes::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, DiskBytes::Mapped { .. })
    }
}

pub trait BlockReader: Send + Sync {
    /// Fetches and checksum-verifies the block at `addr`.
    fn read(&self, addr: &BlockAddr) -> Result<DiskBytes>;
}

/// File-backed block reader. Maps the file when `mapped` is requested at
/// open; otherwise serves owned copies.
#[derive(Debug)]
pub struct FileBlockReader {
    file: File,
    map: Option<Arc<Mmap>>,
}

impl FileBlockReader {
    /// Opens `path` for mapped reads. The file must not be truncated while
    /// the reader or any page image borrowing its mapping is alive.
    pub fn open_mapped<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: Mmap::map is unsafe because external modification of the
        // file would make the mapping's contents unstable. This is safe
        // because:
        // 1. Block files are append-only; existing block ranges are never
        //    rewritten in place.
        // 2. The mapping is Arc-shared into page images, so it outlives
        //    every borrowed range.
        // 3. All reads are bounds-checked against the mapping length.
        let map = unsafe { Mmap::map(&file).map_err(StoreError::Io)? };
        Ok(Self {
            file,
            map: Some(Arc::new(map)),
        })
    }

    /// Opens `path` for owned (copying) reads.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self { file, map: None })
    }

    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset).map_err(StoreError::Io)
    }

    #[cfg(not(unix))]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::io::Read;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn verify(addr: &BlockAddr, payload: &[u8]) -> Result<()> {
        let sum = BLOCK_CRC.checksum(payload);
        if sum != addr.checksum {
            return Err(StoreError::format(format!(
                "block checksum mismatch at offset {}: stored {:#010x}, computed {:#010x}",
                addr.offset, addr.checksum, sum
            )));
        }
        Ok(())
    }
}

impl BlockReader for FileBlockReader {
    fn read(&self, addr: &BlockAddr) -> Result<DiskBytes> {
        let offset = usize::try_from(addr.offset)
            .map_err(|_| StoreError::format("block offset out of range"))?;
        let len = addr.size as usize;

        if let Some(map) = &self.map {
            if offset + len > map.len() {
                return Err(StoreError::format(format!(
                    "block [{}, {}) past end of mapping ({} bytes)",
                    offset,
                    offset + len,
                    map.len()
                )));
            }
            let bytes = DiskBytes::Mapped {
                map: Arc::clone(map),
                offset,
                len,
            };
            Self::verify(addr, bytes.as_slice())?;
            return Ok(bytes);
        }

        let mut buf = vec![0u8; len];
        self.read_exact_at(&mut buf, addr.offset)?;
        Self::verify(addr, &buf)?;
        Ok(DiskBytes::Owned(buf))
    }
}

/// Appends `payload` as one block to the file at `path`, creating it if
/// needed, and returns the address cookie. Fixture and tool path; the
/// engine's block allocator lives elsewhere.
pub fn append_block<P: AsRef<Path>>(path: P, payload: &[u8]) -> Result<BlockAddr> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let offset = file.seek(SeekFrom::End(0))?;
    file.write_all(payload)?;
    file.sync_data()?;
    Ok(BlockAddr {
        offset,
        size: payload.len() as u32,
        checksum: BLOCK_CRC.checksum(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn block_addr_pack_roundtrip() {
        let addr = BlockAddr {
            offset: 0x1_0000,
            size: 16384,
            checksum: 0xDEAD_BEEF,
        };
        let cookie = addr.pack();
        assert_eq!(BlockAddr::unpack(&cookie).unwrap(), addr);
    }

    #[test]
    fn block_addr_unpack_rejects_trailing_bytes() {
        let mut cookie = BlockAddr {
            offset: 1,
            size: 2,
            checksum: 3,
        }
        .pack();
        cookie.push(0);
        assert!(BlockAddr::unpack(&cookie).is_err());
    }

    #[test]
    fn owned_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        let addr = append_block(&path, b"hello block").unwrap();

        let reader = FileBlockReader::open(&path).unwrap();
        let bytes = reader.read(&addr).unwrap();
        assert!(!bytes.is_mapped());
        assert_eq!(bytes.as_slice(), b"hello block");
    }

    #[test]
    fn mapped_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        let a = append_block(&path, b"first").unwrap();
        let b = append_block(&path, b"second").unwrap();

        let reader = FileBlockReader::open_mapped(&path).unwrap();
        let first = reader.read(&a).unwrap();
        let second = reader.read(&b).unwrap();
        assert!(first.is_mapped());
        assert_eq!(first.as_slice(), b"first");
        assert_eq!(second.as_slice(), b"second");
    }

    #[test]
    fn checksum_mismatch_is_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        let mut addr = append_block(&path, b"payload").unwrap();
        addr.checksum ^= 1;

        let reader = FileBlockReader::open(&path).unwrap();
        let err = reader.read(&addr).unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[test]
    fn mapped_read_out_of_bounds_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        append_block(&path, b"short").unwrap();

        let reader = FileBlockReader::open_mapped(&path).unwrap();
        let bogus = BlockAddr {
            offset: 0,
            size: 4096,
            checksum: 0,
        };
        assert!(reader.read(&bogus).is_err());
    }
}
