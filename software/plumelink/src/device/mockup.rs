//! Software stand-in for a device control loop.
//!
//! No hardware is touched. The loop honours the command queue, keeps the
//! status flags truthful, produces placeholder artifacts in continuous
//! mode, and walks a list of exposures for a dark sequence.

use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use super::{Artifact, DeviceCommand, DeviceFlags, DeviceLink, DeviceSettings, RetryPolicy};

/// Idle wait on the command queue when not capturing.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Longest gap between continuous frames, whatever the framerate.
const MAX_FRAME_PERIOD: Duration = Duration::from_secs(60);

/// Mock device loop state.
pub struct MockDevice<S> {
    name: String,
    commands: Receiver<DeviceCommand>,
    flags: Arc<DeviceFlags>,
    settings: Arc<Mutex<S>>,
    artifacts: Sender<Artifact>,
    with_metadata: bool,
    dark_sweep: Vec<i64>,
    frame_gap: Duration,
    counter: u64,
}

/// A running mock device: the link for its role, its artifact queue, and its thread.
pub struct MockDeviceHandle<S> {
    pub link: DeviceLink<S>,
    pub artifacts: Receiver<Artifact>,
    pub thread: JoinHandle<()>,
}

impl<S: DeviceSettings> MockDevice<S> {
    /// Start a mock device thread.
    ///
    /// `dark_sweep` is the exposure list walked by a dark sequence, one
    /// artifact per entry spaced by `frame_gap`.
    pub fn spawn(
        name: &str,
        settings: S,
        with_metadata: bool,
        dark_sweep: Vec<i64>,
        frame_gap: Duration,
        retry: RetryPolicy,
    ) -> std::io::Result<MockDeviceHandle<S>> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (art_tx, art_rx) = unbounded();
        let flags = Arc::new(DeviceFlags::default());
        let settings = Arc::new(Mutex::new(settings));

        let device = MockDevice {
            name: name.to_owned(),
            commands: cmd_rx,
            flags: flags.clone(),
            settings: settings.clone(),
            artifacts: art_tx,
            with_metadata,
            dark_sweep,
            frame_gap,
            counter: 0,
        };
        let thread = Builder::new()
            .name(format!("device-{name}"))
            .spawn(move || device.run())?;

        Ok(MockDeviceHandle {
            link: DeviceLink::new(cmd_tx, flags, settings, retry),
            artifacts: art_rx,
            thread,
        })
    }

    fn run(mut self) {
        if let Some(settings) = self.settings() {
            self.flags.set_auto_exposure(settings.auto_exposure());
        }
        info!("Mock {} started", self.name);

        loop {
            let wait = if self.flags.continuous() {
                self.frame_period()
            } else {
                IDLE_POLL
            };
            match self.commands.recv_timeout(wait) {
                Ok(cmd) => {
                    if !self.apply(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.flags.continuous() {
                        self.capture(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.flags.set_continuous(false);
        self.flags.set_interactive(false);
        self.flags.set_dark_capture(false);
        info!("Mock {} stopped", self.name);
    }

    /// Returns `false` when the loop should exit.
    fn apply(&mut self, cmd: DeviceCommand) -> bool {
        debug!("Mock {} applying {cmd:?}", self.name);
        match cmd {
            DeviceCommand::Exposure(value) => self.update(|s| s.set_exposure(value)),
            DeviceCommand::Framerate(value) => self.update(|s| s.set_framerate(value)),
            DeviceCommand::AutoExposure(on) => {
                self.flags.set_auto_exposure(on);
                self.update(|s| s.set_auto_exposure(on));
            }
            DeviceCommand::CaptureType(kind) => {
                self.update(|s| s.set_capture_type(kind.clone()));
                self.capture(None);
            }
            DeviceCommand::StartContinuous => {
                self.flags.set_interactive(true);
                self.flags.set_continuous(true);
            }
            DeviceCommand::StopContinuous => {
                self.flags.set_continuous(false);
                self.flags.set_interactive(false);
            }
            DeviceCommand::StartDark => return self.dark_sequence(),
            DeviceCommand::Exit => return false,
        }
        true
    }

    /// Walk the dark sweep. Returns `false` if an exit arrived mid-sequence.
    fn dark_sequence(&mut self) -> bool {
        self.flags.set_continuous(false);
        self.flags.set_dark_capture(true);
        info!("Mock {} dark sequence over {:?}", self.name, self.dark_sweep);

        let sweep = self.dark_sweep.clone();
        let mut keep_running = true;
        for exposure in sweep {
            match self.commands.try_recv() {
                Ok(DeviceCommand::Exit) | Err(TryRecvError::Disconnected) => {
                    keep_running = false;
                    break;
                }
                Ok(other) => debug!("Mock {} ignoring {other:?} during dark sequence", self.name),
                Err(TryRecvError::Empty) => {}
            }
            self.capture(Some(exposure));
            std::thread::sleep(self.frame_gap);
        }

        self.flags.set_dark_capture(false);
        if keep_running {
            self.flags.complete_dark();
            info!("Mock {} dark sequence complete", self.name);
        }
        keep_running
    }

    fn capture(&mut self, dark_exposure: Option<i64>) {
        let Some(settings) = self.settings() else {
            return;
        };
        let (exposure, kind) = match dark_exposure {
            Some(exposure) => (exposure, "Dark"),
            None => (settings.exposure(), settings.capture_type()),
        };
        let stamp = Utc::now().format("%Y-%m-%dT%H%M%S%.3f");
        let stem = format!("{stamp}_{}_{exposure}_{kind}", self.name);
        self.counter = self.counter.wrapping_add(1);

        let artifact = Artifact {
            filename: format!("{stem}.{}", S::EXTENSION),
            payload: self.counter.to_le_bytes().to_vec(),
            metadata: self
                .with_metadata
                .then(|| (format!("{stem}.json"), format!("{{\"exposure\":{exposure}}}").into_bytes())),
        };
        if self.artifacts.send(artifact).is_err() {
            debug!("Mock {} artifact queue closed", self.name);
        }
    }

    fn frame_period(&self) -> Duration {
        let rate = self.settings().map_or(0.0, |s| s.framerate());
        if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate).min(MAX_FRAME_PERIOD)
        } else {
            MAX_FRAME_PERIOD
        }
    }

    fn settings(&self) -> Option<S> {
        match self.settings.lock() {
            Ok(s) => Some(s.clone()),
            Err(_) => {
                warn!("Mock {} settings lock poisoned", self.name);
                None
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut S)) {
        match self.settings.lock() {
            Ok(mut s) => f(&mut s),
            Err(_) => warn!("Mock {} settings lock poisoned", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CameraSettings;
    use std::time::Instant;

    fn camera() -> MockDeviceHandle<CameraSettings> {
        MockDevice::spawn(
            "cam",
            CameraSettings::default(),
            true,
            vec![1, 2, 3],
            Duration::from_millis(1),
            RetryPolicy::once(),
        )
        .unwrap()
    }

    #[test]
    fn dark_sequence_emits_sweep_and_counts() {
        let dev = camera();
        dev.link.enqueue(DeviceCommand::StartDark).unwrap();

        let mut names = Vec::new();
        for _ in 0..3 {
            let a = dev.artifacts.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(a.metadata.is_some());
            names.push(a.filename);
        }
        assert!(names[0].ends_with("_cam_1_Dark.png"), "{}", names[0]);
        assert!(names[2].ends_with("_cam_3_Dark.png"), "{}", names[2]);

        let start = Instant::now();
        while dev.link.flags().darks_completed() == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dev.link.flags().darks_completed(), 1);
        assert!(!dev.link.flags().dark_capture());

        dev.link.enqueue(DeviceCommand::Exit).unwrap();
        dev.thread.join().unwrap();
    }

    #[test]
    fn continuous_flags_follow_commands() {
        let dev = camera();
        dev.link.enqueue(DeviceCommand::StartContinuous).unwrap();
        dev.link.enqueue(DeviceCommand::Exposure(1234)).unwrap();
        dev.link
            .enqueue(DeviceCommand::CaptureType("Test".into()))
            .unwrap();

        let a = dev.artifacts.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(a.filename.ends_with("_cam_1234_Test.png"), "{}", a.filename);
        assert!(dev.link.flags().continuous());
        assert!(dev.link.flags().loop_owns_settings());

        dev.link.enqueue(DeviceCommand::StopContinuous).unwrap();
        dev.link.enqueue(DeviceCommand::Exit).unwrap();
        dev.thread.join().unwrap();
        assert!(!dev.link.flags().continuous());
    }
}
