//! Operation Executor (C3): applies one `InstallOperation` to one
//! partition's target writer.
//!
//! Dispatch mirrors the teacher's `process_operation_streaming` in
//! `payload/payload_dumper.rs` (REPLACE/REPLACE_XZ/REPLACE_BZ/ZERO) and
//! `payload/diff.rs::process_diff_operation` (SOURCE_COPY and the
//! BSDIFF-family patch operations), generalized from "dump to a file" to
//! "write through a `TargetWriter` the caller controls" so the Delta
//! Performer can hand it either a real block device or a snapshot.

pub mod devices;

pub use devices::{FileBackedPartition, InMemoryPartition};

use crate::error::ErrorCode;
use crate::proto::{Extent, InstallOperation, install_operation::Type as OpType};
use crate::utils::sha256_hex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

pub type Result<T> = std::result::Result<T, ErrorCode>;

#[async_trait::async_trait]
pub trait TargetWriter: Send {
    async fn write_extents(&mut self, extents: &[Extent], block_size: u64, data: &[u8]) -> Result<()>;
    async fn zero_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<()>;
    /// Returns `true` if the discard is guaranteed to read back as zero.
    async fn discard_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait SourceReader: Send {
    async fn read_extents(&mut self, extents: &[Extent], block_size: u64) -> Result<Vec<u8>>;
}

fn verify_blob_hash(op_index: usize, blob: &[u8], expected: Option<&Vec<u8>>) -> Result<()> {
    match expected {
        Some(expected) if expected.is_empty() => Ok(()),
        Some(expected) => {
            let actual = Sha256::digest(blob);
            if actual.as_slice() == expected.as_slice() {
                Ok(())
            } else {
                Err(ErrorCode::DownloadOperationHashMismatch(op_index))
            }
        }
        None => Ok(()),
    }
}

fn expected_dst_len(op: &InstallOperation, block_size: u64) -> usize {
    (crate::proto::extent_list_blocks(&op.dst_extents) * block_size) as usize
}

async fn decompress_xz(blob: &[u8]) -> Result<Vec<u8>> {
    use async_compression::tokio::bufread::XzDecoder;
    let mut decoder = XzDecoder::new(tokio::io::BufReader::new(blob));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(|e| ErrorCode::DownloadOperationExecutionError(0, e.to_string()))?;
    Ok(out)
}

async fn decompress_bz(blob: &[u8]) -> Result<Vec<u8>> {
    use async_compression::tokio::bufread::BzDecoder;
    let mut decoder = BzDecoder::new(tokio::io::BufReader::new(blob));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(|e| ErrorCode::DownloadOperationExecutionError(0, e.to_string()))?;
    Ok(out)
}

#[cfg(feature = "diff_ota")]
fn apply_bsdiff(source: &[u8], patch: &[u8], op_index: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    bsdiff_android::patch_bsdf2(source, patch, &mut out)
        .map_err(|e| ErrorCode::DownloadOperationExecutionError(op_index, e.to_string()))?;
    Ok(out)
}

/// Applies `op` to `target`. `blob` is the operation's data bytes already
/// read from the payload's data region (absent for ZERO/DISCARD/
/// SOURCE_COPY, which carry no blob). `source` is required for
/// SOURCE_COPY and the diff algorithms; `None` is only valid for a full
/// payload.
pub async fn apply_operation(
    op_index: usize,
    op: &InstallOperation,
    blob: Option<&[u8]>,
    block_size: u64,
    source: Option<&mut dyn SourceReader>,
    target: &mut dyn TargetWriter,
) -> Result<()> {
    if let Some(blob) = blob {
        verify_blob_hash(op_index, blob, op.data_sha256_hash.as_ref())?;
    }

    match op.r#type() {
        OpType::Replace => {
            let blob = blob.ok_or(ErrorCode::DownloadOperationHashMissingError(op_index))?;
            if blob.len() != expected_dst_len(op, block_size) {
                return Err(ErrorCode::DownloadOperationExecutionError(
                    op_index,
                    "REPLACE blob size does not match destination extents".into(),
                ));
            }
            target.write_extents(&op.dst_extents, block_size, blob).await
        }
        OpType::ReplaceXz => {
            let blob = blob.ok_or(ErrorCode::DownloadOperationHashMissingError(op_index))?;
            let data = decompress_xz(blob).await?;
            target.write_extents(&op.dst_extents, block_size, &data).await
        }
        OpType::ReplaceBz => {
            let blob = blob.ok_or(ErrorCode::DownloadOperationHashMissingError(op_index))?;
            let data = decompress_bz(blob).await?;
            target.write_extents(&op.dst_extents, block_size, &data).await
        }
        OpType::Zero => target.zero_extents(&op.dst_extents, block_size).await,
        OpType::Discard => {
            let deterministic = target.discard_extents(&op.dst_extents, block_size).await?;
            if !deterministic {
                target.zero_extents(&op.dst_extents, block_size).await?;
            }
            Ok(())
        }
        OpType::SourceCopy => {
            let source = source.ok_or(ErrorCode::FilesystemCopierError(
                "SOURCE_COPY requires a source reader".into(),
            ))?;
            if crate::proto::extent_list_blocks(&op.src_extents)
                != crate::proto::extent_list_blocks(&op.dst_extents)
            {
                return Err(ErrorCode::DownloadOperationExecutionError(
                    op_index,
                    "SOURCE_COPY source/destination block counts differ".into(),
                ));
            }
            let data = source.read_extents(&op.src_extents, block_size).await?;
            if let Some(expected) = &op.src_sha256_hash {
                let actual = Sha256::digest(&data);
                if actual.as_slice() != expected.as_slice() {
                    return Err(ErrorCode::FilesystemCopierError(format!(
                        "SOURCE_COPY source hash mismatch (got {})",
                        sha256_hex(&data)
                    )));
                }
            }
            target.write_extents(&op.dst_extents, block_size, &data).await
        }
        #[cfg(feature = "diff_ota")]
        OpType::SourceBsdiff | OpType::BrotliBsdiff => {
            let source = source.ok_or(ErrorCode::FilesystemCopierError(
                "diff operation requires a source reader".into(),
            ))?;
            let blob = blob.ok_or(ErrorCode::DownloadOperationHashMissingError(op_index))?;
            let source_data = source.read_extents(&op.src_extents, block_size).await?;
            let patch = if op.r#type() == OpType::BrotliBsdiff {
                let mut decompressed = Vec::new();
                let mut decoder = brotli::Decompressor::new(blob, 4096);
                std::io::Read::read_to_end(&mut decoder, &mut decompressed).map_err(|e| {
                    ErrorCode::DownloadOperationExecutionError(op_index, e.to_string())
                })?;
                decompressed
            } else {
                blob.to_vec()
            };
            let patched = apply_bsdiff(&source_data, &patch, op_index)?;
            if patched.len() != expected_dst_len(op, block_size) {
                return Err(ErrorCode::DownloadOperationExecutionError(
                    op_index,
                    "patched data size does not match destination extents".into(),
                ));
            }
            target.write_extents(&op.dst_extents, block_size, &patched).await
        }
        #[cfg(feature = "diff_ota")]
        OpType::Lz4diffBsdiff => {
            let source = source.ok_or(ErrorCode::FilesystemCopierError(
                "diff operation requires a source reader".into(),
            ))?;
            let blob = blob.ok_or(ErrorCode::DownloadOperationHashMissingError(op_index))?;
            let source_data = source.read_extents(&op.src_extents, block_size).await?;
            let patch = lz4_flex::decompress_size_prepended(blob).map_err(|e| {
                ErrorCode::DownloadOperationExecutionError(op_index, e.to_string())
            })?;
            let patched = apply_bsdiff(&source_data, &patch, op_index)?;
            if patched.len() != expected_dst_len(op, block_size) {
                return Err(ErrorCode::DownloadOperationExecutionError(
                    op_index,
                    "patched data size does not match destination extents".into(),
                ));
            }
            target.write_extents(&op.dst_extents, block_size, &patched).await
        }
        OpType::Puffdiff | OpType::Lz4diffPuffdiff | OpType::Zucchini => {
            Err(ErrorCode::DownloadOperationExecutionError(
                op_index,
                format!("{:?} has no available decoder in this build", op.r#type()),
            ))
        }
        #[cfg(not(feature = "diff_ota"))]
        OpType::SourceBsdiff | OpType::BrotliBsdiff | OpType::Lz4diffBsdiff => {
            Err(ErrorCode::DownloadOperationExecutionError(
                op_index,
                "rebuild with the 'diff_ota' feature to apply delta operations".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replace_op(dst_start: u64, blocks: u64, hash: Vec<u8>) -> InstallOperation {
        InstallOperation {
            r#type: OpType::Replace as i32,
            dst_extents: vec![Extent {
                start_block: Some(dst_start),
                num_blocks: Some(blocks),
            }],
            data_sha256_hash: Some(hash),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn replace_writes_verbatim_bytes() {
        let blob = vec![b'A'; 8192];
        let hash = Sha256::digest(&blob).to_vec();
        let op = replace_op(0, 2, hash);
        let mut target = InMemoryPartition::new(2, 4096);

        apply_operation(0, &op, Some(&blob), 4096, None, &mut target)
            .await
            .unwrap();

        assert_eq!(target.blocks, blob);
    }

    #[tokio::test]
    async fn replace_rejects_hash_mismatch() {
        let blob = vec![b'A'; 4096];
        let op = replace_op(0, 1, vec![0u8; 32]);
        let mut target = InMemoryPartition::new(1, 4096);

        let err = apply_operation(0, &op, Some(&blob), 4096, None, &mut target)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::DownloadOperationHashMismatch(0));
    }

    #[tokio::test]
    async fn zero_clears_destination() {
        let op = InstallOperation {
            r#type: OpType::Zero as i32,
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(1),
            }],
            ..Default::default()
        };
        let mut target = InMemoryPartition::new(1, 4096);
        target.blocks.fill(0xFF);

        apply_operation(0, &op, None, 4096, None, &mut target)
            .await
            .unwrap();

        assert!(target.blocks.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn source_copy_copies_blocks_and_checks_hash() {
        let mut source = InMemoryPartition::new(1, 4096);
        source.blocks.fill(b'Z');
        let hash = Sha256::digest(&source.blocks).to_vec();

        let op = InstallOperation {
            r#type: OpType::SourceCopy as i32,
            src_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(1),
            }],
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(1),
            }],
            src_sha256_hash: Some(hash),
            ..Default::default()
        };
        let mut target = InMemoryPartition::new(1, 4096);

        apply_operation(0, &op, None, 4096, Some(&mut source), &mut target)
            .await
            .unwrap();

        assert_eq!(target.blocks, source.blocks);
    }

    #[tokio::test]
    async fn discard_falls_back_to_zero_when_nondeterministic() {
        let file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
        let mut target = FileBackedPartition::new(file);
        target
            .write_extents(
                &[Extent {
                    start_block: Some(0),
                    num_blocks: Some(1),
                }],
                4096,
                &vec![0xFFu8; 4096],
            )
            .await
            .unwrap();

        let op = InstallOperation {
            r#type: OpType::Discard as i32,
            dst_extents: vec![Extent {
                start_block: Some(0),
                num_blocks: Some(1),
            }],
            ..Default::default()
        };
        apply_operation(0, &op, None, 4096, None, &mut target)
            .await
            .unwrap();

        let data = {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            target.file.seek(std::io::SeekFrom::Start(0)).await.unwrap();
            let mut buf = vec![0u8; 4096];
            target.file.read_exact(&mut buf).await.unwrap();
            buf
        };
        assert!(data.iter().all(|&b| b == 0));
    }
}
