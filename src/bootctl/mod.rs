//! Boot-Slot Coordinator (C7): the narrow seam the Delta Performer uses to
//! query and flip A/B boot slots once an update is fully written and
//! verified.
//!
//! Real slot state lives in bootloader-owned flash (`boot_control` HAL on
//! Android, `vboot`/`crossystem` on ChromeOS) that this crate has no
//! business touching directly. `BootControl` is the trait boundary; the
//! only implementation shipped here is an in-memory fake, grounded on the
//! [[hardware]] capability-injection pattern the teacher never needed (its
//! payload dump never writes a device) but which spec §9 calls for
//! explicitly so tests never depend on global/ambient device state.

use crate::error::{ErrorCode, Result};

pub trait BootControl: Send + Sync {
    fn slot_count(&self) -> u32;

    /// The slot the device is currently running from.
    fn current_slot(&self) -> u32;

    /// Whether `slot` is marked bootable by the bootloader.
    fn is_slot_bootable(&self, slot: u32) -> Result<bool>;

    /// Marks `slot` unbootable, e.g. after a failed update write.
    fn mark_slot_unbootable(&self, slot: u32) -> Result<()>;

    /// Marks `slot` as the one to boot next. Idempotent: calling it again
    /// with the same slot is a no-op, not an error.
    fn set_active_boot_slot(&self, slot: u32) -> Result<()>;

    /// Confirms the currently-running slot is good, clearing any
    /// rollback-to-previous-slot countdown the bootloader is tracking.
    /// Idempotent for the same reason as `set_active_boot_slot`.
    fn mark_boot_successful(&self) -> Result<()>;

    fn get_suffix(&self, slot: u32) -> String {
        match slot {
            0 => "_a".to_string(),
            1 => "_b".to_string(),
            n => format!("_{n}"),
        }
    }
}

fn check_slot(slot: u32, slot_count: u32) -> Result<()> {
    if slot >= slot_count {
        Err(ErrorCode::KernelDeviceOpenError)
    } else {
        Ok(())
    }
}

/// In-memory `BootControl` for tests and for hosts with no real bootloader
/// integration (the demo CLI). Slot 0 boots first and is bootable by
/// default; every other slot starts out not bootable, matching a factory
/// image that has never completed an update into its other slot.
pub struct FakeBootControl {
    slot_count: u32,
    current_slot: std::sync::atomic::AtomicU32,
    active_slot: std::sync::atomic::AtomicU32,
    bootable: Vec<std::sync::atomic::AtomicBool>,
    boot_successful: std::sync::atomic::AtomicBool,
}

impl FakeBootControl {
    pub fn new(slot_count: u32, current_slot: u32) -> Self {
        let bootable = (0..slot_count)
            .map(|slot| std::sync::atomic::AtomicBool::new(slot == current_slot))
            .collect();
        Self {
            slot_count,
            current_slot: std::sync::atomic::AtomicU32::new(current_slot),
            active_slot: std::sync::atomic::AtomicU32::new(current_slot),
            bootable,
            boot_successful: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

impl BootControl for FakeBootControl {
    fn slot_count(&self) -> u32 {
        self.slot_count
    }

    fn current_slot(&self) -> u32 {
        self.current_slot.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn is_slot_bootable(&self, slot: u32) -> Result<bool> {
        check_slot(slot, self.slot_count)?;
        Ok(self.bootable[slot as usize].load(std::sync::atomic::Ordering::SeqCst))
    }

    fn mark_slot_unbootable(&self, slot: u32) -> Result<()> {
        check_slot(slot, self.slot_count)?;
        self.bootable[slot as usize].store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn set_active_boot_slot(&self, slot: u32) -> Result<()> {
        check_slot(slot, self.slot_count)?;
        self.bootable[slot as usize].store(true, std::sync::atomic::Ordering::SeqCst);
        self.active_slot.store(slot, std::sync::atomic::Ordering::SeqCst);
        self.boot_successful.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn mark_boot_successful(&self) -> Result<()> {
        self.boot_successful.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

impl FakeBootControl {
    /// Test/demo helper: what `set_active_boot_slot` most recently chose.
    pub fn active_slot(&self) -> u32 {
        self.active_slot.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn boot_successful(&self) -> bool {
        self.boot_successful.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_has_only_current_slot_bootable() {
        let bc = FakeBootControl::new(2, 0);
        assert!(bc.is_slot_bootable(0).unwrap());
        assert!(!bc.is_slot_bootable(1).unwrap());
    }

    #[test]
    fn set_active_boot_slot_is_idempotent() {
        let bc = FakeBootControl::new(2, 0);
        bc.set_active_boot_slot(1).unwrap();
        assert_eq!(bc.active_slot(), 1);
        assert!(!bc.boot_successful());
        bc.set_active_boot_slot(1).unwrap();
        assert_eq!(bc.active_slot(), 1);
    }

    #[test]
    fn mark_boot_successful_is_idempotent() {
        let bc = FakeBootControl::new(2, 0);
        bc.mark_boot_successful().unwrap();
        bc.mark_boot_successful().unwrap();
        assert!(bc.boot_successful());
    }

    #[test]
    fn out_of_range_slot_is_rejected() {
        let bc = FakeBootControl::new(2, 0);
        assert!(bc.is_slot_bootable(5).is_err());
        assert!(bc.mark_slot_unbootable(5).is_err());
        assert!(bc.set_active_boot_slot(5).is_err());
    }

    #[test]
    fn suffix_matches_android_convention() {
        let bc = FakeBootControl::new(2, 0);
        assert_eq!(bc.get_suffix(0), "_a");
        assert_eq!(bc.get_suffix(1), "_b");
    }
}
