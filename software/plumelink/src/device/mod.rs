//! The boundary between role dispatchers and the devices they own.
//!
//! A device runs its own control loop. Roles reach it through a
//! [`DeviceLink`]: a command queue into the loop, status flags out of it,
//! and a settings block the role may write only while the loop is not
//! driving acquisition.

pub mod mockup;
pub mod retry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

pub use mockup::{MockDevice, MockDeviceHandle};
pub use retry::RetryPolicy;

/// Requests accepted on a device's command queue.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCommand {
    /// Shutter speed (us) for a camera, integration time (ms) for the spectrometer
    Exposure(i64),
    Framerate(f64),
    AutoExposure(bool),
    /// Capture one frame tagged with this type
    CaptureType(String),
    StartContinuous,
    StopContinuous,
    StartDark,
    Exit,
}

/// Status published by a device loop.
#[derive(Debug, Default)]
pub struct DeviceFlags {
    auto_exposure: AtomicBool,
    interactive: AtomicBool,
    continuous: AtomicBool,
    dark_capture: AtomicBool,
    darks_completed: AtomicU64,
}

impl DeviceFlags {
    pub fn auto_exposure(&self) -> bool {
        self.auto_exposure.load(Ordering::Acquire)
    }

    pub fn set_auto_exposure(&self, on: bool) {
        self.auto_exposure.store(on, Ordering::Release);
    }

    /// Whether the loop is reading settings from its queue rather than the settings block.
    pub fn interactive(&self) -> bool {
        self.interactive.load(Ordering::Acquire)
    }

    pub fn set_interactive(&self, on: bool) {
        self.interactive.store(on, Ordering::Release);
    }

    pub fn continuous(&self) -> bool {
        self.continuous.load(Ordering::Acquire)
    }

    pub fn set_continuous(&self, on: bool) {
        self.continuous.store(on, Ordering::Release);
    }

    pub fn dark_capture(&self) -> bool {
        self.dark_capture.load(Ordering::Acquire)
    }

    pub fn set_dark_capture(&self, on: bool) {
        self.dark_capture.store(on, Ordering::Release);
    }

    /// Number of dark sequences run to completion since start.
    pub fn darks_completed(&self) -> u64 {
        self.darks_completed.load(Ordering::Acquire)
    }

    pub fn complete_dark(&self) {
        self.darks_completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether the loop currently owns exposure and framerate.
    pub fn loop_owns_settings(&self) -> bool {
        self.interactive() || self.continuous()
    }
}

/// Settings every device exposes to the mock-up loop and to `LOG 1` dumps.
pub trait DeviceSettings: Clone + Send + 'static {
    /// File extension of this device's artifacts
    const EXTENSION: &'static str;

    fn exposure(&self) -> i64;
    fn set_exposure(&mut self, value: i64);
    fn framerate(&self) -> f64;
    fn set_framerate(&mut self, value: f64);
    fn auto_exposure(&self) -> bool;
    fn set_auto_exposure(&mut self, on: bool);
    fn capture_type(&self) -> &str;
    fn set_capture_type(&mut self, value: String);
}

/// Camera acquisition settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CameraSettings {
    pub shutter_us: i64,
    pub framerate: f64,
    pub auto_shutter: bool,
    pub min_saturation: f64,
    pub max_saturation: f64,
    pub saturation_pixels: i64,
    /// Rows used for the saturation check; negative counts from the bottom
    pub saturation_rows: i64,
    pub capture_type: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            shutter_us: 10_000,
            framerate: 0.25,
            auto_shutter: false,
            min_saturation: 0.7,
            max_saturation: 0.9,
            saturation_pixels: 100,
            saturation_rows: -1,
            capture_type: "Plume".to_string(),
        }
    }
}

impl DeviceSettings for CameraSettings {
    const EXTENSION: &'static str = "png";

    fn exposure(&self) -> i64 {
        self.shutter_us
    }
    fn set_exposure(&mut self, value: i64) {
        self.shutter_us = value;
    }
    fn framerate(&self) -> f64 {
        self.framerate
    }
    fn set_framerate(&mut self, value: f64) {
        self.framerate = value;
    }
    fn auto_exposure(&self) -> bool {
        self.auto_shutter
    }
    fn set_auto_exposure(&mut self, on: bool) {
        self.auto_shutter = on;
    }
    fn capture_type(&self) -> &str {
        &self.capture_type
    }
    fn set_capture_type(&mut self, value: String) {
        self.capture_type = value;
    }
}

/// Spectrometer acquisition settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SpectrometerSettings {
    pub integration_ms: i64,
    pub framerate: f64,
    pub coadd: i64,
    pub auto_integration: bool,
    pub saturation_pixels: i64,
    pub wavelength_min: i64,
    pub wavelength_max: i64,
    pub min_saturation: f64,
    pub max_saturation: f64,
    pub capture_type: String,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            integration_ms: 100,
            framerate: 1.0,
            coadd: 1,
            auto_integration: false,
            saturation_pixels: 2,
            wavelength_min: 310,
            wavelength_max: 330,
            min_saturation: 0.6,
            max_saturation: 0.9,
            capture_type: "Plume".to_string(),
        }
    }
}

impl DeviceSettings for SpectrometerSettings {
    const EXTENSION: &'static str = "npy";

    fn exposure(&self) -> i64 {
        self.integration_ms
    }
    fn set_exposure(&mut self, value: i64) {
        self.integration_ms = value;
    }
    fn framerate(&self) -> f64 {
        self.framerate
    }
    fn set_framerate(&mut self, value: f64) {
        self.framerate = value;
    }
    fn auto_exposure(&self) -> bool {
        self.auto_integration
    }
    fn set_auto_exposure(&mut self, on: bool) {
        self.auto_integration = on;
    }
    fn capture_type(&self) -> &str {
        &self.capture_type
    }
    fn set_capture_type(&mut self, value: String) {
        self.capture_type = value;
    }
}

/// A captured image or spectrum. The fabric only relays notifications about it.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub filename: String,
    pub payload: Vec<u8>,
    /// Metadata file name and contents, cameras only
    pub metadata: Option<(String, Vec<u8>)>,
}

/// How a setting request was carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Written to the settings block
    Direct,
    /// Queued for the device loop
    Queued,
}

/// A role's handle on its device.
#[derive(Debug)]
pub struct DeviceLink<S> {
    commands: Sender<DeviceCommand>,
    flags: Arc<DeviceFlags>,
    settings: Arc<Mutex<S>>,
    retry: RetryPolicy,
}

impl<S> Clone for DeviceLink<S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            flags: self.flags.clone(),
            settings: self.settings.clone(),
            retry: self.retry,
        }
    }
}

impl<S> DeviceLink<S> {
    pub fn new(
        commands: Sender<DeviceCommand>,
        flags: Arc<DeviceFlags>,
        settings: Arc<Mutex<S>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            commands,
            flags,
            settings,
            retry,
        }
    }

    pub fn flags(&self) -> &DeviceFlags {
        &self.flags
    }

    /// Put a request on the device's command queue.
    pub fn enqueue(&self, cmd: DeviceCommand) -> Result<(), DeviceError> {
        self.retry.run(|| {
            self.commands
                .send(cmd.clone())
                .map_err(|_| DeviceError::QueueDisconnected)
        })
    }

    /// Run `f` on the settings block. A contended lock is retried.
    pub fn with_settings<T>(&self, mut f: impl FnMut(&mut S) -> T) -> Result<T, DeviceError> {
        self.retry.run(|| match self.settings.try_lock() {
            Ok(mut settings) => Ok(f(&mut settings)),
            Err(TryLockError::WouldBlock) => Err(DeviceError::Busy("settings")),
            Err(TryLockError::Poisoned(_)) => Err(DeviceError::SettingsPoisoned),
        })
    }

    /// Write directly while the loop is idle, otherwise queue `cmd` for it.
    pub fn set_or_enqueue(
        &self,
        cmd: DeviceCommand,
        direct: impl FnMut(&mut S),
    ) -> Result<Applied, DeviceError> {
        if self.flags.loop_owns_settings() {
            self.enqueue(cmd)?;
            Ok(Applied::Queued)
        } else {
            self.with_settings(direct)?;
            Ok(Applied::Direct)
        }
    }
}

impl<S: Clone> DeviceLink<S> {
    pub fn settings(&self) -> Result<S, DeviceError> {
        self.with_settings(|s| s.clone())
    }
}

impl<S: DeviceSettings> DeviceLink<S> {
    pub fn set_exposure(&self, value: i64) -> Result<Applied, DeviceError> {
        self.set_or_enqueue(DeviceCommand::Exposure(value), |s| s.set_exposure(value))
    }

    pub fn set_framerate(&self, value: f64) -> Result<Applied, DeviceError> {
        self.set_or_enqueue(DeviceCommand::Framerate(value), |s| {
            s.set_framerate(value)
        })
    }

    pub fn set_auto_exposure(&self, on: bool) -> Result<Applied, DeviceError> {
        let applied = self.set_or_enqueue(DeviceCommand::AutoExposure(on), |s| {
            s.set_auto_exposure(on)
        })?;
        if applied == Applied::Direct {
            self.flags.set_auto_exposure(on);
        }
        Ok(applied)
    }

    /// Stop continuous capture if running and queue a dark sequence.
    ///
    /// Returns the completed-sequence count to watch for the new one.
    pub fn start_dark(&self) -> Result<u64, DeviceError> {
        if self.flags.continuous() {
            self.enqueue(DeviceCommand::StopContinuous)?;
        }
        let baseline = self.flags.darks_completed();
        self.enqueue(DeviceCommand::StartDark)?;
        Ok(baseline)
    }

    /// Stop acquisition and ask the loop to exit.
    pub fn wind_down(&self) -> Result<(), DeviceError> {
        if self.flags.continuous() {
            self.enqueue(DeviceCommand::StopContinuous)?;
        }
        self.enqueue(DeviceCommand::Exit)
    }
}
