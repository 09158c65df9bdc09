//! The streaming payload decoder (spec §4.2).
//!
//! Grounded on the teacher's `payload/payload_parser.rs::parse_payload`,
//! which reads the fixed `CrAU` header framing off an `AsyncRead` and
//! decodes the manifest with `prost`. This version adds the validation
//! gate (`ValidateMetadata`), a running whole-payload SHA-256, and a
//! sequential cursor so the same reader can be used for ordinary forward
//! consumption and for resumption (re-hashing a prefix after a restart,
//! spec §4.6).

use crate::config::EngineConfig;
use crate::constants::{IO_SLICE_SIZE, PAYLOAD_MAGIC};
use crate::error::ErrorCode;
use crate::hardware::HardwareInterface;
use crate::payload::signature::PublicKeyVerifier;
use crate::proto::{DeltaArchiveManifest, Signatures};
use prost::Message;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

pub type Result<T> = std::result::Result<T, ErrorCode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    WaitHeader,
    WaitManifest,
    WaitMetadataSignature,
    ValidateMetadata,
    WaitOperations,
    WaitPayloadSignature,
    Done,
}

#[derive(Debug)]
pub struct ParsedManifest {
    pub manifest: DeltaArchiveManifest,
    /// `magic + version + manifest_len + metadata_signature_len + manifest bytes`
    /// (spec §3's definition of "metadata size").
    pub metadata_size: u64,
    /// Absolute byte offset in the payload where the data-blob region
    /// starts (immediately after the metadata signature blob).
    pub data_offset: u64,
}

/// Sequentially consumes a payload byte stream, maintaining a running
/// SHA-256 over every byte read so far. Intentionally does not require
/// `AsyncSeek`: resumption re-drives the same forward-only interface from
/// byte 0, discarding (but still hashing) the already-applied prefix,
/// which is what spec §4.6 describes.
pub struct PayloadParser<R> {
    reader: R,
    state: ParserState,
    hasher: Sha256,
    consumed: u64,
}

impl<R: AsyncRead + Unpin> PayloadParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ParserState::WaitHeader,
            hasher: Sha256::new(),
            consumed: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    async fn read_hashed(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader
            .read_exact(buf)
            .await
            .map_err(|_| ErrorCode::DownloadTransferError)?;
        self.hasher.update(&buf[..]);
        self.consumed += buf.len() as u64;
        Ok(())
    }

    /// Reads and hashes `len` bytes without retaining them. Used both to
    /// skip the metadata signature blob and, during resumption, to
    /// fast-forward through an already-applied prefix of the data region.
    pub async fn skip_hashed(&mut self, mut len: u64) -> Result<()> {
        let mut buf = vec![0u8; IO_SLICE_SIZE.min(len.max(1) as usize)];
        while len > 0 {
            let chunk = (len as usize).min(buf.len());
            self.read_hashed(&mut buf[..chunk]).await?;
            len -= chunk as u64;
        }
        Ok(())
    }

    /// Reads the next `len` bytes of operation blob data, hashing them
    /// into the running payload digest as they go by.
    pub async fn read_operation_blob(&mut self, len: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len as usize];
        self.read_hashed(&mut data).await?;
        Ok(data)
    }

    /// Drives `WaitHeader` through `ValidateMetadata` (spec §4.2 rules
    /// 1-5), leaving the parser positioned at the start of the data-blob
    /// region with `state() == WaitOperations`.
    pub async fn parse_header_and_manifest(
        &mut self,
        config: &EngineConfig,
        hardware: &dyn HardwareInterface,
        metadata_verifier: Option<&PublicKeyVerifier>,
    ) -> Result<ParsedManifest> {
        self.state = ParserState::WaitHeader;
        let mut magic = [0u8; 4];
        self.read_hashed(&mut magic).await?;
        if &magic != PAYLOAD_MAGIC {
            return Err(ErrorCode::DownloadInvalidMetadataMagicString);
        }

        let mut version_buf = [0u8; 8];
        self.read_hashed(&mut version_buf).await?;
        let major_version = u64::from_be_bytes(version_buf);
        if !config.accepts_major_version(major_version) {
            return Err(ErrorCode::UnsupportedMajorPayloadVersion(major_version));
        }

        let mut len_buf = [0u8; 8];
        self.read_hashed(&mut len_buf).await?;
        let manifest_len = u64::from_be_bytes(len_buf);

        let mut sig_len_buf = [0u8; 4];
        self.read_hashed(&mut sig_len_buf).await?;
        let metadata_signature_len = u32::from_be_bytes(sig_len_buf) as u64;

        if manifest_len == 0 || manifest_len > crate::constants::MAX_MANIFEST_SIZE {
            return Err(ErrorCode::DownloadManifestParseError(
                "manifest length is zero or exceeds cap".into(),
            ));
        }
        if metadata_signature_len > crate::constants::MAX_METADATA_SIGNATURE_SIZE {
            return Err(ErrorCode::DownloadMetadataSignatureError);
        }

        self.state = ParserState::WaitManifest;
        let mut manifest_bytes = vec![0u8; manifest_len as usize];
        self.read_hashed(&mut manifest_bytes).await?;

        let metadata_size = 4 + 8 + 8 + 4 + manifest_len;

        self.state = ParserState::WaitMetadataSignature;
        let metadata_signature = if metadata_signature_len > 0 {
            let mut buf = vec![0u8; metadata_signature_len as usize];
            self.read_hashed(&mut buf).await?;
            Some(buf)
        } else {
            None
        };

        self.state = ParserState::ValidateMetadata;

        match (metadata_verifier, &metadata_signature) {
            (Some(verifier), Some(sig_bytes)) => {
                let signatures = Signatures::decode(&sig_bytes[..]).map_err(|_| {
                    ErrorCode::DownloadMetadataSignatureError
                })?;
                let mut pre_sig = Vec::with_capacity(20 + manifest_bytes.len());
                pre_sig.extend_from_slice(PAYLOAD_MAGIC);
                pre_sig.extend_from_slice(&version_buf);
                pre_sig.extend_from_slice(&len_buf);
                pre_sig.extend_from_slice(&sig_len_buf);
                pre_sig.extend_from_slice(&manifest_bytes);

                let verified = signatures
                    .signatures
                    .iter()
                    .filter_map(|s| s.data.as_ref())
                    .any(|sig| verifier.verify(&pre_sig, sig));
                if !verified {
                    return Err(ErrorCode::DownloadMetadataSignatureMismatch);
                }
            }
            (Some(_), None) => return Err(ErrorCode::DownloadMetadataSignatureMissingError),
            (None, _) if config.require_signatures => {
                return Err(ErrorCode::DownloadMetadataSignatureMissingError);
            }
            _ => {}
        }

        let manifest = DeltaArchiveManifest::decode(&manifest_bytes[..])
            .map_err(|e| ErrorCode::DownloadManifestParseError(e.to_string()))?;

        if !config.accepts_minor_version(manifest.minor_version()) {
            return Err(ErrorCode::UnsupportedMinorPayloadVersion(
                manifest.minor_version(),
            ));
        }

        validate_operation_offsets(&manifest)?;

        if let (Some(sig_off), Some(sig_size)) =
            (manifest.signatures_offset, manifest.signatures_size)
        {
            // Best-effort bound: we don't know the total data-blob region
            // size without seeking, but offset/size must at least be
            // internally consistent.
            if sig_size > 0 && sig_off.checked_add(sig_size).is_none() {
                return Err(ErrorCode::DownloadManifestParseError(
                    "signatures_offset + signatures_size overflows".into(),
                ));
            }
        }

        if let Some(max_timestamp) = manifest.max_timestamp {
            let build_timestamp = hardware.build_timestamp();
            if max_timestamp < build_timestamp {
                return Err(ErrorCode::PayloadTimestampError {
                    manifest: max_timestamp,
                    build: build_timestamp,
                });
            }
        }

        self.state = ParserState::WaitOperations;

        Ok(ParsedManifest {
            manifest,
            metadata_size,
            data_offset: self.consumed,
        })
    }

    /// Call once every operation's blob has been consumed. Reads the
    /// trailing payload-signature blob, verifies it against the running
    /// hash computed over everything that precedes it, and finally checks
    /// the full-payload hash against `expected_payload_hash`.
    pub async fn finish(
        &mut self,
        payload_signature_len: u64,
        payload_verifier: Option<&PublicKeyVerifier>,
        require_signatures: bool,
        expected_payload_hash: &[u8],
    ) -> Result<()> {
        self.state = ParserState::WaitPayloadSignature;

        let hash_excluding_signature = self.hasher.clone().finalize();

        let signature_bytes = if payload_signature_len > 0 {
            Some(self.read_operation_blob(payload_signature_len).await?)
        } else {
            None
        };

        match (payload_verifier, &signature_bytes) {
            (Some(verifier), Some(sig_bytes)) => {
                let signatures = Signatures::decode(&sig_bytes[..])
                    .map_err(|_| ErrorCode::DownloadPayloadVerificationError)?;
                let verified = signatures
                    .signatures
                    .iter()
                    .filter_map(|s| s.data.as_ref())
                    .any(|sig| verifier.verify_digest(&hash_excluding_signature, sig));
                if !verified {
                    return Err(ErrorCode::DownloadPayloadVerificationError);
                }
            }
            (Some(_), None) => return Err(ErrorCode::DownloadPayloadVerificationError),
            (None, _) if require_signatures => {
                return Err(ErrorCode::DownloadPayloadVerificationError);
            }
            _ => {}
        }

        let full_hash = self.hasher.clone().finalize();
        if full_hash.as_slice() != expected_payload_hash {
            return Err(ErrorCode::DownloadPayloadVerificationError);
        }

        self.state = ParserState::Done;
        Ok(())
    }
}

/// spec §3 InstallOperation invariant: `data_offset` is strictly
/// monotonically increasing across all operations in the order emitted,
/// and equals the cumulative sum of all prior `data_length`s.
fn validate_operation_offsets(manifest: &DeltaArchiveManifest) -> Result<()> {
    let mut expected_next_offset = 0u64;
    let mut saw_any = false;
    for partition in &manifest.partitions {
        for op in &partition.operations {
            let Some(offset) = op.data_offset else {
                continue;
            };
            let length = op.data_length.unwrap_or(0);
            if saw_any && offset < expected_next_offset {
                return Err(ErrorCode::DownloadManifestParseError(format!(
                    "data_offset {offset} is not monotonically increasing (expected >= {expected_next_offset})"
                )));
            }
            if offset != expected_next_offset {
                return Err(ErrorCode::DownloadManifestParseError(format!(
                    "data_offset {offset} does not equal cumulative prior length {expected_next_offset}"
                )));
            }
            expected_next_offset = offset + length;
            saw_any = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::FixedHardware;
    use crate::proto::{Extent, InstallOperation, PartitionInfo, PartitionUpdate};
    use std::io::Cursor;

    fn build_payload(manifest: &DeltaArchiveManifest, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let manifest_bytes = manifest.encode_to_vec();
        let mut payload = Vec::new();
        payload.extend_from_slice(PAYLOAD_MAGIC);
        payload.extend_from_slice(&2u64.to_be_bytes());
        payload.extend_from_slice(&(manifest_bytes.len() as u64).to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&manifest_bytes);
        payload.extend_from_slice(data);
        let full_hash = Sha256::digest(&payload).to_vec();
        (payload, full_hash)
    }

    fn simple_manifest() -> DeltaArchiveManifest {
        DeltaArchiveManifest {
            block_size: Some(4096),
            minor_version: Some(0),
            partitions: vec![PartitionUpdate {
                partition_name: "system".into(),
                new_partition_info: Some(PartitionInfo {
                    size: Some(4096),
                    hash: Some(Sha256::digest([b'A'; 4096]).to_vec()),
                }),
                operations: vec![InstallOperation {
                    r#type: crate::proto::install_operation::Type::Replace as i32,
                    data_offset: Some(0),
                    data_length: Some(4096),
                    dst_extents: vec![Extent {
                        start_block: Some(0),
                        num_blocks: Some(1),
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parses_header_and_manifest_and_hashes_to_completion() {
        let manifest = simple_manifest();
        let data = vec![b'A'; 4096];
        let (payload, full_hash) = build_payload(&manifest, &data);

        let mut parser = PayloadParser::new(Cursor::new(payload));
        let config = EngineConfig {
            require_signatures: false,
            ..Default::default()
        };
        let hw = FixedHardware::new(0, false);
        let parsed = parser
            .parse_header_and_manifest(&config, &hw, None)
            .await
            .unwrap();
        assert_eq!(parsed.manifest.partitions.len(), 1);

        let blob = parser.read_operation_blob(4096).await.unwrap();
        assert_eq!(blob, data);

        parser.finish(0, None, false, &full_hash).await.unwrap();
        assert_eq!(parser.state(), ParserState::Done);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut payload = b"XXXX".to_vec();
        payload.extend_from_slice(&[0u8; 20]);
        let mut parser = PayloadParser::new(Cursor::new(payload));
        let config = EngineConfig::default();
        let hw = FixedHardware::new(0, false);
        let err = parser
            .parse_header_and_manifest(&config, &hw, None)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::DownloadInvalidMetadataMagicString);
    }

    #[tokio::test]
    async fn rejects_timestamp_downgrade() {
        let mut manifest = simple_manifest();
        manifest.max_timestamp = Some(100);
        let (payload, _) = build_payload(&manifest, &vec![b'A'; 4096]);

        let mut parser = PayloadParser::new(Cursor::new(payload));
        let config = EngineConfig {
            require_signatures: false,
            ..Default::default()
        };
        let hw = FixedHardware::new(200, false);
        let err = parser
            .parse_header_and_manifest(&config, &hw, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ErrorCode::PayloadTimestampError {
                manifest: 100,
                build: 200
            }
        );
    }

    #[tokio::test]
    async fn rejects_non_monotonic_data_offset() {
        let mut manifest = simple_manifest();
        manifest.partitions[0].operations.push(InstallOperation {
            r#type: crate::proto::install_operation::Type::Replace as i32,
            data_offset: Some(0),
            data_length: Some(10),
            dst_extents: vec![Extent {
                start_block: Some(1),
                num_blocks: Some(1),
            }],
            ..Default::default()
        });
        let (payload, _) = build_payload(&manifest, &vec![b'A'; 4096]);
        let mut parser = PayloadParser::new(Cursor::new(payload));
        let config = EngineConfig {
            require_signatures: false,
            ..Default::default()
        };
        let hw = FixedHardware::new(0, false);
        assert!(
            parser
                .parse_header_and_manifest(&config, &hw, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn resumption_rehashes_prefix_and_matches_uninterrupted_hash() {
        let manifest = simple_manifest();
        let data = vec![b'A'; 4096];
        let (payload, full_hash) = build_payload(&manifest, &data);

        // Uninterrupted run.
        let mut parser = PayloadParser::new(Cursor::new(payload.clone()));
        let config = EngineConfig {
            require_signatures: false,
            ..Default::default()
        };
        let hw = FixedHardware::new(0, false);
        let parsed = parser
            .parse_header_and_manifest(&config, &hw, None)
            .await
            .unwrap();
        let _ = parser.read_operation_blob(4096).await.unwrap();
        parser.finish(0, None, false, &full_hash).await.unwrap();

        // "Resumed" run: re-open from byte 0, skip the already-applied
        // data region, and check the hash still lands on the same value.
        let mut resumed = PayloadParser::new(Cursor::new(payload));
        let _ = resumed
            .parse_header_and_manifest(&config, &hw, None)
            .await
            .unwrap();
        resumed.skip_hashed(4096).await.unwrap();
        resumed.finish(0, None, false, &full_hash).await.unwrap();

        assert_eq!(parsed.data_offset, resumed.bytes_consumed() - 4096);
    }
}
