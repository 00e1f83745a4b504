//! Dark-capture progress across the three devices.

use std::sync::atomic::{AtomicBool, Ordering};

use plumelink_shared::RoleId;

/// One running flag per device, aggregated by OR.
#[derive(Debug, Default)]
pub struct DarkCaptureProgress {
    camera_a: AtomicBool,
    camera_b: AtomicBool,
    spectrometer: AtomicBool,
}

impl DarkCaptureProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, role: RoleId) -> Option<&AtomicBool> {
        match role {
            RoleId::CameraA => Some(&self.camera_a),
            RoleId::CameraB => Some(&self.camera_b),
            RoleId::Spectrometer => Some(&self.spectrometer),
            _ => None,
        }
    }

    /// Mark a device's dark sequence as running. Non-device roles are ignored.
    pub fn start(&self, role: RoleId) {
        if let Some(flag) = self.flag(role) {
            flag.store(true, Ordering::Release);
        }
    }

    /// Mark a device's dark sequence as finished.
    ///
    /// Returns `true` when this call took the aggregate from running to idle.
    pub fn finish(&self, role: RoleId) -> bool {
        let Some(flag) = self.flag(role) else {
            return false;
        };
        let was_running = flag.swap(false, Ordering::AcqRel);
        was_running && !self.is_running()
    }

    pub fn is_device_running(&self, role: RoleId) -> bool {
        self.flag(role)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Whether any device is still in its dark sequence.
    pub fn is_running(&self) -> bool {
        self.camera_a.load(Ordering::Acquire)
            || self.camera_b.load(Ordering::Acquire)
            || self.spectrometer.load(Ordering::Acquire)
    }
}
