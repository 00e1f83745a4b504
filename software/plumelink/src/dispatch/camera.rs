//! Camera role (CM1 on-band, CM2 off-band).

use tracing::{debug, info};

use plumelink_shared::{Code, CommandSet, RoleId, Value};

use super::{float, int, require, Handler, HandlerError, HandlerResult, Role, RoleCtx};
use crate::device::{CameraSettings, DeviceCommand, DeviceLink};

/// Which of the paired cameras a role drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    /// On-band
    A,
    /// Off-band
    B,
}

impl Band {
    pub const fn role(self) -> RoleId {
        match self {
            Band::A => RoleId::CameraA,
            Band::B => RoleId::CameraB,
        }
    }

    pub const fn hello(self) -> Code {
        match self {
            Band::A => Code::HLA,
            Band::B => Code::HLB,
        }
    }

    pub const fn shutter(self) -> Code {
        match self {
            Band::A => Code::SSA,
            Band::B => Code::SSB,
        }
    }

    pub const fn auto_shutter(self) -> Code {
        match self {
            Band::A => Code::ATA,
            Band::B => Code::ATB,
        }
    }

    pub const fn capture_type(self) -> Code {
        match self {
            Band::A => Code::TPA,
            Band::B => Code::TPB,
        }
    }

    /// Code announcing a new image from this camera.
    pub const fn new_image(self) -> Code {
        match self {
            Band::A => Code::NIA,
            Band::B => Code::NIB,
        }
    }

    /// Code announcing new image metadata from this camera.
    pub const fn new_metadata(self) -> Code {
        match self {
            Band::A => Code::NMA,
            Band::B => Code::NMB,
        }
    }
}

const BAND_A: &[(Code, Handler<CameraRole>)] = &[
    (Code::HLO, CameraRole::hello),
    (Code::SSA, CameraRole::shutter),
    (Code::FRC, CameraRole::framerate),
    (Code::ATA, CameraRole::auto_shutter),
    (Code::SMN, CameraRole::min_saturation),
    (Code::SMX, CameraRole::max_saturation),
    (Code::PXC, CameraRole::saturation_pixels),
    (Code::RWC, CameraRole::saturation_rows),
    (Code::TPA, CameraRole::capture_type),
    (Code::DKC, CameraRole::dark),
    (Code::SPC, CameraRole::stop_continuous),
    (Code::STC, CameraRole::start_continuous),
    (Code::LOG, CameraRole::log),
    (Code::EXT, CameraRole::exit),
];

const BAND_B: &[(Code, Handler<CameraRole>)] = &[
    (Code::HLO, CameraRole::hello),
    (Code::SSB, CameraRole::shutter),
    (Code::FRC, CameraRole::framerate),
    (Code::ATB, CameraRole::auto_shutter),
    (Code::SMN, CameraRole::min_saturation),
    (Code::SMX, CameraRole::max_saturation),
    (Code::PXC, CameraRole::saturation_pixels),
    (Code::RWC, CameraRole::saturation_rows),
    (Code::TPB, CameraRole::capture_type),
    (Code::DKC, CameraRole::dark),
    (Code::SPC, CameraRole::stop_continuous),
    (Code::STC, CameraRole::start_continuous),
    (Code::LOG, CameraRole::log),
    (Code::EXT, CameraRole::exit),
];

/// Dispatcher for one camera.
pub struct CameraRole {
    band: Band,
    device: DeviceLink<CameraSettings>,
    /// Completed-dark count to beat before announcing `DFC`
    dark_watch: Option<u64>,
}

impl CameraRole {
    pub fn new(band: Band, device: DeviceLink<CameraSettings>) -> Self {
        Self {
            band,
            device,
            dark_watch: None,
        }
    }

    pub fn band(&self) -> Band {
        self.band
    }

    fn hello(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if value.as_bool() {
            ctx.reply_with(self.band.hello(), false);
        }
        Ok(())
    }

    fn shutter(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        // Auto shutter owns the shutter speed
        if self.device.flags().auto_exposure() {
            return Err(HandlerError::Rejected);
        }
        let shutter = int(value)?;
        self.device.set_exposure(shutter)?;
        ctx.reply_with(self.band.shutter(), shutter);
        Ok(())
    }

    fn framerate(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let rate = float(value)?;
        self.device.set_framerate(rate)?;
        ctx.reply_with(Code::FRC, rate);
        Ok(())
    }

    fn auto_shutter(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let on = value.as_bool();
        self.device.set_auto_exposure(on)?;
        ctx.reply_with(self.band.auto_shutter(), on);
        Ok(())
    }

    fn min_saturation(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let min = float(value)?;
        let accepted = self.device.with_settings(|s| {
            let ok = min < s.max_saturation;
            if ok {
                s.min_saturation = min;
            }
            ok
        })?;
        if !accepted {
            return Err(HandlerError::Rejected);
        }
        ctx.reply_with(Code::SMN, min);
        Ok(())
    }

    fn max_saturation(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let max = float(value)?;
        let accepted = self.device.with_settings(|s| {
            let ok = max > s.min_saturation;
            if ok {
                s.max_saturation = max;
            }
            ok
        })?;
        if !accepted {
            return Err(HandlerError::Rejected);
        }
        ctx.reply_with(Code::SMX, max);
        Ok(())
    }

    fn saturation_pixels(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let pixels = int(value)?;
        self.device.with_settings(|s| s.saturation_pixels = pixels)?;
        ctx.reply_with(Code::PXC, pixels);
        Ok(())
    }

    fn saturation_rows(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let rows = int(value)?;
        self.device.with_settings(|s| s.saturation_rows = rows)?;
        ctx.reply_with(Code::RWC, rows);
        Ok(())
    }

    fn capture_type(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let kind = value.as_str().ok_or(HandlerError::Rejected)?.to_owned();
        self.device
            .enqueue(DeviceCommand::CaptureType(kind.clone()))?;
        ctx.reply_with(self.band.capture_type(), kind);
        Ok(())
    }

    fn dark(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        let baseline = self.device.start_dark()?;
        self.dark_watch = Some(baseline);
        info!("{} dark sequence requested by {}", self.band.role(), ctx.source());
        ctx.reply_with(Code::DKC, true);
        Ok(())
    }

    fn stop_continuous(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.enqueue(DeviceCommand::StopContinuous)?;
        ctx.reply_with(Code::SPC, true);
        Ok(())
    }

    fn start_continuous(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.enqueue(DeviceCommand::StartContinuous)?;
        ctx.reply_with(Code::STC, true);
        Ok(())
    }

    fn log(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        // LOG 0 is a connection test answered by the orchestrator
        if int(value)? != 1 {
            return Ok(());
        }
        let s = self.device.settings()?;
        let flags = self.device.flags();
        let dump = CommandSet::new()
            .with(self.band.shutter(), s.shutter_us)
            .with(Code::FRC, s.framerate)
            .with(self.band.auto_shutter(), flags.auto_exposure())
            .with(Code::SMN, s.min_saturation)
            .with(Code::SMX, s.max_saturation)
            .with(Code::PXC, s.saturation_pixels)
            .with(Code::RWC, s.saturation_rows)
            .with(self.band.capture_type(), s.capture_type)
            .with(Code::LOG, 1);
        ctx.reply(dump);
        Ok(())
    }

    fn exit(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.wind_down()?;
        ctx.stop();
        // Confirms the exit without asking anyone else to exit
        ctx.reply_with(Code::EXT, false);
        Ok(())
    }
}

impl Role for CameraRole {
    fn id(&self) -> RoleId {
        self.band.role()
    }

    fn handlers(&self) -> &'static [(Code, Handler<Self>)] {
        match self.band {
            Band::A => BAND_A,
            Band::B => BAND_B,
        }
    }

    fn tick(&mut self, ctx: &mut RoleCtx<'_>) {
        let Some(baseline) = self.dark_watch else {
            return;
        };
        if self.device.flags().darks_completed() > baseline {
            self.dark_watch = None;
            info!("{} dark sequence complete", self.band.role());
            ctx.announce(CommandSet::new().with(Code::DFC, true));
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.device.enqueue(DeviceCommand::Exit) {
            debug!("{} device already gone: {e}", self.band.role());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use crossbeam::channel::{unbounded, Receiver};

    use super::*;
    use crate::device::{DeviceFlags, RetryPolicy};
    use crate::dispatch::testing::{exchange, Recorder};

    fn camera(band: Band) -> (CameraRole, Receiver<DeviceCommand>) {
        let (tx, rx) = unbounded();
        let link = DeviceLink::new(
            tx,
            Arc::new(DeviceFlags::default()),
            Arc::new(Mutex::new(CameraSettings::default())),
            RetryPolicy::once(),
        );
        (CameraRole::new(band, link), rx)
    }

    fn from_client() -> CommandSet {
        CommandSet::from_role(RoleId::External)
    }

    #[test]
    fn hello_is_answered_per_band() {
        let (mut cam, _rx) = camera(Band::B);
        let sent = exchange(&mut cam, from_client().with(Code::HLO, true));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), RoleId::CameraB);
        assert_eq!(sent[0].get(Code::HLB), Some(&Value::Bool(false)));
        assert_eq!(sent[0].destination(), Some(vec![RoleId::External]));
    }

    #[test]
    fn other_band_codes_are_ignored() {
        let (mut cam, rx) = camera(Band::A);
        let sent = exchange(&mut cam, from_client().with(Code::SSB, 5000));
        assert!(sent.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(cam.device.settings().unwrap().shutter_us, 10_000);
    }

    #[test]
    fn shutter_goes_direct_or_queued() {
        let (mut cam, rx) = camera(Band::A);
        let sent = exchange(&mut cam, from_client().with(Code::SSA, 5000));
        assert_eq!(sent[0].get(Code::SSA), Some(&Value::Int(5000)));
        assert_eq!(cam.device.settings().unwrap().shutter_us, 5000);
        assert!(rx.try_recv().is_err());

        cam.device.flags().set_continuous(true);
        exchange(&mut cam, from_client().with(Code::SSA, 7000));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::Exposure(7000));
        assert_eq!(cam.device.settings().unwrap().shutter_us, 5000);
    }

    #[test]
    fn shutter_refused_under_auto() {
        let (mut cam, _rx) = camera(Band::A);
        exchange(&mut cam, from_client().with(Code::ATA, true));
        assert!(cam.device.flags().auto_exposure());

        let sent = exchange(&mut cam, from_client().with(Code::SSA, 5000));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].errors(), vec![Code::SSA]);
    }

    #[test]
    fn saturation_pair_stays_ordered() {
        let (mut cam, _rx) = camera(Band::A);
        let sent = exchange(&mut cam, from_client().with(Code::SMN, 0.9));
        assert_eq!(sent[0].errors(), vec![Code::SMN]);

        let sent = exchange(&mut cam, from_client().with(Code::SMX, 0.5));
        assert_eq!(sent[0].errors(), vec![Code::SMX]);

        let sent = exchange(&mut cam, from_client().with(Code::SMN, 0.2));
        assert_eq!(sent[0].get(Code::SMN), Some(&Value::Float(0.2)));
        let sent = exchange(&mut cam, from_client().with(Code::SMX, 0.5));
        assert_eq!(sent[0].get(Code::SMX), Some(&Value::Float(0.5)));
    }

    #[test]
    fn dark_reply_then_finished_announcement() {
        let (mut cam, rx) = camera(Band::A);
        cam.device.flags().set_continuous(true);

        let sent = exchange(&mut cam, CommandSet::from_role(RoleId::Orchestrator).with(Code::DKC, true));
        assert_eq!(sent[0].get(Code::DKC), Some(&Value::Bool(true)));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::StopContinuous);
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::StartDark);

        let out = Recorder::default();
        let stop = AtomicBool::new(false);
        let idle = CommandSet::new();
        let mut ctx = RoleCtx::new(RoleId::CameraA, &idle, &out, &stop);
        cam.tick(&mut ctx);
        assert!(out.take().is_empty());

        cam.device.flags().complete_dark();
        cam.tick(&mut ctx);
        cam.tick(&mut ctx);
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), RoleId::CameraA);
        assert_eq!(sent[0].get(Code::DFC), Some(&Value::Bool(true)));
        assert_eq!(sent[0].destination(), None);
    }

    #[test]
    fn settings_dump_on_log_1() {
        let (mut cam, _rx) = camera(Band::B);
        assert!(exchange(&mut cam, from_client().with(Code::LOG, 0)).is_empty());

        let sent = exchange(&mut cam, from_client().with(Code::LOG, 1));
        let dump = &sent[0];
        assert_eq!(dump.get(Code::SSB), Some(&Value::Int(10_000)));
        assert_eq!(dump.get(Code::TPB), Some(&Value::Str("Plume".into())));
        assert_eq!(dump.get(Code::ATB), Some(&Value::Bool(false)));
        assert!(!dump.contains(Code::SSA));
    }

    #[test]
    fn exit_winds_down_and_stops() {
        let (mut cam, rx) = camera(Band::A);
        let out = Recorder::default();
        let stop = AtomicBool::new(false);
        let cmd = CommandSet::from_role(RoleId::Orchestrator).with(Code::EXT, true);
        crate::dispatch::dispatch(&mut cam, &cmd, &out, &stop);

        assert!(stop.load(std::sync::atomic::Ordering::Acquire));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::Exit);
        let sent = out.take();
        assert_eq!(sent[0].get(Code::EXT), Some(&Value::Bool(false)));

        let sent = exchange(&mut cam, from_client().with(Code::EXT, false));
        assert_eq!(sent[0].errors(), vec![Code::EXT]);
    }
}
