//! Spectrometer role (SPC).

use tracing::{debug, info};

use plumelink_shared::{Code, CommandSet, RoleId, Value};

use super::{float, int, require, Handler, HandlerError, HandlerResult, Role, RoleCtx};
use crate::device::{DeviceCommand, DeviceLink, SpectrometerSettings};

const HANDLERS: &[(Code, Handler<SpectrometerRole>)] = &[
    (Code::HLO, SpectrometerRole::hello),
    (Code::SSS, SpectrometerRole::integration),
    (Code::FRS, SpectrometerRole::framerate),
    (Code::CAD, SpectrometerRole::coadd),
    (Code::PXS, SpectrometerRole::saturation_pixels),
    (Code::WMN, SpectrometerRole::wavelength_min),
    (Code::WMX, SpectrometerRole::wavelength_max),
    (Code::SNS, SpectrometerRole::min_saturation),
    (Code::SXS, SpectrometerRole::max_saturation),
    (Code::ATS, SpectrometerRole::auto_integration),
    (Code::TPS, SpectrometerRole::capture_type),
    (Code::DKS, SpectrometerRole::dark),
    (Code::SPS, SpectrometerRole::stop_continuous),
    (Code::STS, SpectrometerRole::start_continuous),
    (Code::LOG, SpectrometerRole::log),
    (Code::EXT, SpectrometerRole::exit),
];

pub struct SpectrometerRole {
    device: DeviceLink<SpectrometerSettings>,
    dark_watch: Option<u64>,
}

impl SpectrometerRole {
    pub fn new(device: DeviceLink<SpectrometerSettings>) -> Self {
        Self {
            device,
            dark_watch: None,
        }
    }

    fn hello(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if value.as_bool() {
            ctx.reply_with(Code::HLS, false);
        }
        Ok(())
    }

    fn integration(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if self.device.flags().auto_exposure() {
            return Err(HandlerError::Rejected);
        }
        let ms = int(value)?;
        self.device.set_exposure(ms)?;
        ctx.reply_with(Code::SSS, ms);
        Ok(())
    }

    fn framerate(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let rate = float(value)?;
        self.device.set_framerate(rate)?;
        ctx.reply_with(Code::FRS, rate);
        Ok(())
    }

    fn coadd(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let coadd = int(value)?;
        self.device.with_settings(|s| s.coadd = coadd)?;
        ctx.reply_with(Code::CAD, coadd);
        Ok(())
    }

    fn saturation_pixels(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let pixels = int(value)?;
        self.device.with_settings(|s| s.saturation_pixels = pixels)?;
        ctx.reply_with(Code::PXS, pixels);
        Ok(())
    }

    fn wavelength_min(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let nm = int(value)?;
        self.update_pair(|s| {
            (nm < s.wavelength_max).then(|| s.wavelength_min = nm)
        })?;
        ctx.reply_with(Code::WMN, nm);
        Ok(())
    }

    fn wavelength_max(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let nm = int(value)?;
        self.update_pair(|s| {
            (nm > s.wavelength_min).then(|| s.wavelength_max = nm)
        })?;
        ctx.reply_with(Code::WMX, nm);
        Ok(())
    }

    fn min_saturation(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let min = float(value)?;
        self.update_pair(|s| {
            (min < s.max_saturation).then(|| s.min_saturation = min)
        })?;
        ctx.reply_with(Code::SNS, min);
        Ok(())
    }

    fn max_saturation(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let max = float(value)?;
        self.update_pair(|s| {
            (max > s.min_saturation).then(|| s.max_saturation = max)
        })?;
        ctx.reply_with(Code::SXS, max);
        Ok(())
    }

    /// Apply one side of a min/max pair; `None` from `f` means the order would break.
    fn update_pair(
        &self,
        mut f: impl FnMut(&mut SpectrometerSettings) -> Option<()>,
    ) -> HandlerResult {
        self.device
            .with_settings(|s| f(s))?
            .ok_or(HandlerError::Rejected)
    }

    fn auto_integration(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let on = value.as_bool();
        self.device.set_auto_exposure(on)?;
        ctx.reply_with(Code::ATS, on);
        Ok(())
    }

    fn capture_type(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let kind = value.as_str().ok_or(HandlerError::Rejected)?.to_owned();
        self.device
            .enqueue(DeviceCommand::CaptureType(kind.clone()))?;
        ctx.reply_with(Code::TPS, kind);
        Ok(())
    }

    fn dark(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.dark_watch = Some(self.device.start_dark()?);
        info!("Spectrometer dark sequence requested by {}", ctx.source());
        ctx.reply_with(Code::DKS, true);
        Ok(())
    }

    fn stop_continuous(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.enqueue(DeviceCommand::StopContinuous)?;
        ctx.reply_with(Code::SPS, true);
        Ok(())
    }

    fn start_continuous(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.enqueue(DeviceCommand::StartContinuous)?;
        ctx.reply_with(Code::STS, true);
        Ok(())
    }

    fn log(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if int(value)? != 1 {
            return Ok(());
        }
        let s = self.device.settings()?;
        let dump = CommandSet::new()
            .with(Code::SSS, s.integration_ms)
            .with(Code::FRS, s.framerate)
            .with(Code::CAD, s.coadd)
            .with(Code::ATS, self.device.flags().auto_exposure())
            .with(Code::PXS, s.saturation_pixels)
            .with(Code::WMN, s.wavelength_min)
            .with(Code::WMX, s.wavelength_max)
            .with(Code::SNS, s.min_saturation)
            .with(Code::SXS, s.max_saturation)
            .with(Code::TPS, s.capture_type)
            .with(Code::LOG, 1);
        ctx.reply(dump);
        Ok(())
    }

    fn exit(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        self.device.wind_down()?;
        ctx.stop();
        ctx.reply_with(Code::EXT, false);
        Ok(())
    }
}

impl Role for SpectrometerRole {
    fn id(&self) -> RoleId {
        RoleId::Spectrometer
    }

    fn handlers(&self) -> &'static [(Code, Handler<Self>)] {
        HANDLERS
    }

    fn tick(&mut self, ctx: &mut RoleCtx<'_>) {
        match self.dark_watch {
            Some(baseline) if self.device.flags().darks_completed() > baseline => {
                self.dark_watch = None;
                info!("Spectrometer dark sequence complete");
                ctx.announce(CommandSet::new().with(Code::DFS, true));
            }
            _ => {}
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.device.enqueue(DeviceCommand::Exit) {
            debug!("Spectrometer device already gone: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crossbeam::channel::{unbounded, Receiver};

    use super::*;
    use crate::device::{DeviceFlags, RetryPolicy};
    use crate::dispatch::testing::exchange;

    fn spectrometer() -> (SpectrometerRole, Receiver<DeviceCommand>) {
        let (tx, rx) = unbounded();
        let link = DeviceLink::new(
            tx,
            Arc::new(DeviceFlags::default()),
            Arc::new(Mutex::new(SpectrometerSettings::default())),
            RetryPolicy::once(),
        );
        (SpectrometerRole::new(link), rx)
    }

    fn from_client() -> CommandSet {
        CommandSet::from_role(RoleId::External)
    }

    #[test]
    fn one_reply_per_code() {
        let (mut spec, _rx) = spectrometer();
        let sent = exchange(
            &mut spec,
            from_client()
                .with(Code::HLO, true)
                .with(Code::CAD, 4)
                .with(Code::FRS, 2.0),
        );
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.source() == RoleId::Spectrometer));
        assert!(sent.iter().any(|s| s.get(Code::HLS) == Some(&Value::Bool(false))));
        assert_eq!(spec.device.settings().unwrap().coadd, 4);
    }

    #[test]
    fn wavelength_window_stays_ordered() {
        let (mut spec, _rx) = spectrometer();
        let sent = exchange(&mut spec, from_client().with(Code::WMN, 340));
        assert_eq!(sent[0].errors(), vec![Code::WMN]);
        let sent = exchange(&mut spec, from_client().with(Code::WMX, 305));
        assert_eq!(sent[0].errors(), vec![Code::WMX]);

        exchange(&mut spec, from_client().with(Code::WMX, 360));
        exchange(&mut spec, from_client().with(Code::WMN, 340));
        let s = spec.device.settings().unwrap();
        assert_eq!((s.wavelength_min, s.wavelength_max), (340, 360));
    }

    #[test]
    fn integration_queued_while_continuous() {
        let (mut spec, rx) = spectrometer();
        exchange(&mut spec, from_client().with(Code::STS, true));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::StartContinuous);

        spec.device.flags().set_continuous(true);
        let sent = exchange(&mut spec, from_client().with(Code::SSS, 250));
        assert_eq!(sent[0].get(Code::SSS), Some(&Value::Int(250)));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::Exposure(250));
    }

    #[test]
    fn dark_completion_announced_once() {
        let (mut spec, rx) = spectrometer();
        let sent = exchange(&mut spec, from_client().with(Code::DKS, true));
        assert_eq!(sent[0].get(Code::DKS), Some(&Value::Bool(true)));
        assert_eq!(rx.try_recv().unwrap(), DeviceCommand::StartDark);

        let out = crate::dispatch::testing::Recorder::default();
        let stop = std::sync::atomic::AtomicBool::new(false);
        let idle = CommandSet::new();
        let mut ctx = RoleCtx::new(RoleId::Spectrometer, &idle, &out, &stop);
        spec.device.flags().complete_dark();
        spec.tick(&mut ctx);
        spec.tick(&mut ctx);
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get(Code::DFS), Some(&Value::Bool(true)));
    }
}
