//! Concrete `TargetWriter`/`SourceReader` implementations.
//!
//! `InMemoryPartition` backs unit and property tests. `FileBackedPartition`
//! is the real device/snapshot-handle implementation, grounded directly on
//! the teacher's `dump_partition`/`process_operation_streaming`, which
//! seeks a `tokio::fs::File` to `start_block * block_size` before every
//! write.

use super::{Result, SourceReader, TargetWriter};
use crate::error::ErrorCode;
use crate::proto::Extent;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

fn io_err(e: std::io::Error) -> ErrorCode {
    ErrorCode::FilesystemCopierError(e.to_string())
}

pub struct InMemoryPartition {
    pub blocks: Vec<u8>,
    pub block_size: u64,
}

impl InMemoryPartition {
    pub fn new(size_in_blocks: u64, block_size: u64) -> Self {
        Self {
            blocks: vec![0u8; (size_in_blocks * block_size) as usize],
            block_size,
        }
    }
}

#[async_trait::async_trait]
impl TargetWriter for InMemoryPartition {
    async fn write_extents(&mut self, extents: &[Extent], block_size: u64, data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        for extent in extents {
            let offset = (extent.start() * block_size) as usize;
            let len = (extent.blocks() * block_size) as usize;
            if offset + len > self.blocks.len() {
                return Err(ErrorCode::NotEnoughSpace {
                    needed: (offset + len) as u64,
                    available: self.blocks.len() as u64,
                });
            }
            self.blocks[offset..offset + len].copy_from_slice(&data[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    async fn zero_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<()> {
        for extent in extents {
            let offset = (extent.start() * block_size) as usize;
            let len = (extent.blocks() * block_size) as usize;
            self.blocks[offset..offset + len].fill(0);
        }
        Ok(())
    }

    async fn discard_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<bool> {
        // An in-memory device can't model an actually-undefined discard
        // read-back, so it always behaves like a deterministic discard.
        self.zero_extents(extents, block_size).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl SourceReader for InMemoryPartition {
    async fn read_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for extent in extents {
            let offset = (extent.start() * block_size) as usize;
            let len = (extent.blocks() * block_size) as usize;
            out.extend_from_slice(&self.blocks[offset..offset + len]);
        }
        Ok(out)
    }
}

pub struct FileBackedPartition {
    pub file: File,
}

impl FileBackedPartition {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

#[async_trait::async_trait]
impl TargetWriter for FileBackedPartition {
    async fn write_extents(&mut self, extents: &[Extent], block_size: u64, data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        for extent in extents {
            let offset = extent.start() * block_size;
            let len = (extent.blocks() * block_size) as usize;
            self.file
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(io_err)?;
            self.file
                .write_all(&data[cursor..cursor + len])
                .await
                .map_err(io_err)?;
            cursor += len;
        }
        Ok(())
    }

    async fn zero_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<()> {
        let zero_block = vec![0u8; block_size as usize];
        for extent in extents {
            self.file
                .seek(std::io::SeekFrom::Start(extent.start() * block_size))
                .await
                .map_err(io_err)?;
            for _ in 0..extent.blocks() {
                self.file.write_all(&zero_block).await.map_err(io_err)?;
            }
        }
        Ok(())
    }

    async fn discard_extents(&mut self, _extents: &[Extent], _block_size: u64) -> Result<bool> {
        // Real block-discard hints require a platform ioctl the teacher
        // crate has no equivalent of; conservatively report
        // non-deterministic so the caller falls back to ZERO, per spec
        // §9's open question on DISCARD fallback semantics.
        Ok(false)
    }
}

#[async_trait::async_trait]
impl SourceReader for FileBackedPartition {
    async fn read_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for extent in extents {
            let offset = extent.start() * block_size;
            let len = (extent.blocks() * block_size) as usize;
            self.file
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(io_err)?;
            let start = out.len();
            out.resize(start + len, 0);
            self.file
                .read_exact(&mut out[start..])
                .await
                .map_err(io_err)?;
        }
        Ok(out)
    }
}
