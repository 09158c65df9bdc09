//! The "hardware interface" capability object spec §9 calls out: a small
//! injected trait rather than process-wide mutable state, matching the
//! teacher's pattern of passing configuration/context objects into its
//! parsing and dumping functions instead of reading globals.

/// Build/device facts the parser and performer need but must not read from
/// ambient global state. A real Android build wires this to
/// `android::base::GetIntProperty("ro.build.date.utc", ...)` and friends;
/// tests and the `demos/` CLI use `FixedHardware`.
pub trait HardwareInterface: Send + Sync {
    /// Unix timestamp (seconds) this build was produced at. Used to refuse
    /// downgrades per spec §4.2 rule 5.
    fn build_timestamp(&self) -> i64;

    /// Whether this is an official signed build (affects whether missing
    /// signatures are tolerated). Test/dev builds may allow unsigned
    /// payloads; official builds never do.
    fn is_official_build(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedHardware {
    pub build_timestamp: i64,
    pub is_official_build: bool,
}

impl FixedHardware {
    pub fn new(build_timestamp: i64, is_official_build: bool) -> Self {
        Self {
            build_timestamp,
            is_official_build,
        }
    }
}

impl HardwareInterface for FixedHardware {
    fn build_timestamp(&self) -> i64 {
        self.build_timestamp
    }

    fn is_official_build(&self) -> bool {
        self.is_official_build
    }
}
