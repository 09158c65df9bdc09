//! The error taxonomy every public engine operation returns into.
//!
//! Internal glue still uses `anyhow` the way the teacher crate does; this
//! enum is the stable, matchable surface handed to external collaborators
//! (the CLI front-end, metrics reporter, IPC surfaces) so they can decide
//! retry/exit-code policy without parsing strings.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    // Transport / format
    #[error("transfer error (retryable)")]
    DownloadTransferError,
    #[error("invalid payload magic, expected 'CrAU'")]
    DownloadInvalidMetadataMagicString,
    #[error("failed to parse manifest: {0}")]
    DownloadManifestParseError(String),
    #[error("unsupported major payload version {0}")]
    UnsupportedMajorPayloadVersion(u64),
    #[error("unsupported minor payload version {0}")]
    UnsupportedMinorPayloadVersion(u32),
    #[error("payload type does not match expected delta/full kind")]
    PayloadMismatchedType,
    #[error("payload size does not match descriptor")]
    PayloadSizeMismatchError,

    // Integrity
    #[error("metadata signature missing but required")]
    DownloadMetadataSignatureMissingError,
    #[error("metadata signature does not verify")]
    DownloadMetadataSignatureError,
    #[error("metadata signature mismatch")]
    DownloadMetadataSignatureMismatch,
    #[error("payload signature/hash verification failed")]
    DownloadPayloadVerificationError,
    #[error("operation {0} blob hash mismatch")]
    DownloadOperationHashMismatch(usize),
    #[error("operation {0} has no hash to verify against")]
    DownloadOperationHashMissingError(usize),
    #[error("new rootfs/partition hash verification failed for {0}")]
    NewRootfsVerificationError(String),
    #[error("verity hash-tree/FEC computation failed: {0}")]
    VerityCalculationError(String),

    // State / resource
    #[error("checkpoint/preference state failed to initialize: {0}")]
    DownloadStateInitializationError(String),
    #[error("failed to open install device for {0}")]
    InstallDeviceOpenError(String),
    #[error("failed to open kernel/boot device")]
    KernelDeviceOpenError,
    #[error("source-copy filesystem verification failed: {0}")]
    FilesystemCopierError(String),
    #[error("not enough space in super partition: need {needed}, have {available}")]
    NotEnoughSpace { needed: u64, available: u64 },
    #[error("on-disk state is corrupted: {0}")]
    DeviceCorrupted(String),
    #[error("operation {0} execution failed: {1}")]
    DownloadOperationExecutionError(usize, String),

    // Policy
    #[error("refusing downgrade: manifest max_timestamp {manifest} < build timestamp {build}")]
    PayloadTimestampError { manifest: i64, build: i64 },
    #[error("update applied but new slot was not made active")]
    UpdatedButNotActive,
    #[error("update canceled by caller")]
    UserCanceled,
}

impl ErrorCode {
    /// Retryable transport errors must not touch the checkpoint (spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::DownloadTransferError)
    }

    /// `UserCanceled` is the only non-fatal code; resumption stays possible.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCode::UserCanceled)
    }
}

pub type Result<T> = std::result::Result<T, ErrorCode>;
