//! Generated `update_metadata` protobuf types.
//!
//! `build.rs` compiles `proto/update_metadata.proto` with `prost-build` the
//! same way the teacher crate compiles it into `DeltaArchiveManifest` and
//! friends (see its `Cargo.toml` `include` list, which names the same
//! proto path).

include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));

impl Extent {
    pub fn start(&self) -> u64 {
        self.start_block.unwrap_or(0)
    }

    pub fn blocks(&self) -> u64 {
        self.num_blocks.unwrap_or(0)
    }
}

pub fn extent_list_blocks(extents: &[Extent]) -> u64 {
    extents.iter().map(Extent::blocks).sum()
}
