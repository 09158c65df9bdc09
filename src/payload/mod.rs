//! Payload Parser (C2): decodes the header, manifest, and signature blobs
//! from a byte stream and authenticates them before any operation is
//! dispatched to the Executor.

pub mod parser;
pub mod signature;

pub use parser::{ParsedManifest, ParserState, PayloadParser};
pub use signature::PublicKeyVerifier;
