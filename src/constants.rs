// SPDX-License-Identifier: Apache-2.0

/// Fixed 4-byte framing magic at the start of every payload.
pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Major versions this engine knows how to frame. Open question in spec §9
/// resolved in DESIGN.md: only the two major versions ever shipped widely.
pub const SUPPORTED_MAJOR_VERSIONS: &[u64] = &[1, 2];

/// Minor versions this engine accepts for delta payloads. 0 is full-payload
/// only; the rest are successive delta-format generations.
pub const SUPPORTED_MINOR_VERSIONS: &[u32] = &[0, 2, 3, 4, 5, 6, 7];

/// Hard cap on manifest / metadata-signature sizes the parser will buffer
/// before declaring the stream malformed (spec §4.2 rule 2).
pub const MAX_MANIFEST_SIZE: u64 = 256 * 1024 * 1024;
pub const MAX_METADATA_SIGNATURE_SIZE: u64 = 64 * 1024;

/// Sliced I/O chunk size so long-running steps yield to the event loop
/// (spec §5).
pub const IO_SLICE_SIZE: usize = 2 * 1024 * 1024;

/// Maximum number of verity leaves hashed per `incremental_finalize` slice.
pub const VERITY_SLICE_LEAVES: usize = 4096;
