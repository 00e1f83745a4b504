//! Artifact notifications.
//!
//! One worker watches every device's artifact queue and tells external
//! clients about each new file, unless dark capture is running or a
//! client has just asked for status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Select, Sender};
use tracing::{debug, error, info};

use plumelink_shared::{Code, CommandSet, RoleId};

use crate::device::Artifact;
use crate::router::{Broadcast, IngressGate};

/// Notification codes for artifacts from `role`: file, then metadata if any.
pub fn notification_codes(role: RoleId) -> Option<(Code, Option<Code>)> {
    match role {
        RoleId::CameraA => Some((Code::NIA, Some(Code::NMA))),
        RoleId::CameraB => Some((Code::NIB, Some(Code::NMB))),
        RoleId::Spectrometer => Some((Code::NIS, None)),
        _ => None,
    }
}

/// The notification for one artifact, or `None` if `role` produces no artifacts.
pub fn notification(role: RoleId, artifact: &Artifact) -> Option<CommandSet> {
    let (file_code, meta_code) = notification_codes(role)?;
    let mut cmd = CommandSet::from_role(RoleId::Orchestrator).with(file_code, artifact.filename.as_str());
    if let (Some(code), Some((name, _))) = (meta_code, &artifact.metadata) {
        cmd.insert(code, name.as_str());
    }
    cmd.set_destination(&[RoleId::External]);
    Some(cmd)
}

pub struct ArtifactRelay {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ArtifactRelay {
    /// Start relaying. Artifacts are handed to `sink` after notification.
    pub fn spawn(
        sources: Vec<(RoleId, Receiver<Artifact>)>,
        out: Arc<dyn Broadcast>,
        gate: Arc<IngressGate>,
        sink: Option<Sender<(RoleId, Artifact)>>,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = Builder::new()
            .name("artifact-relay".to_owned())
            .spawn(move || run(sources, &*out, &gate, sink.as_ref(), &thread_stop, poll))?;
        Ok(Self { stop, thread })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker. It ends once every queue has closed or after [`ArtifactRelay::stop`].
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Artifact relay panicked");
        }
    }
}

fn run(
    mut sources: Vec<(RoleId, Receiver<Artifact>)>,
    out: &dyn Broadcast,
    gate: &IngressGate,
    sink: Option<&Sender<(RoleId, Artifact)>>,
    stop: &AtomicBool,
    poll: Duration,
) {
    info!("Relaying artifacts from {} devices", sources.len());
    while !stop.load(Ordering::Acquire) && !sources.is_empty() {
        let received = {
            let mut sel = Select::new();
            for (_, rx) in &sources {
                sel.recv(rx);
            }
            match sel.select_timeout(poll) {
                Ok(oper) => {
                    let index = oper.index();
                    Some((index, oper.recv(&sources[index].1)))
                }
                Err(_) => None,
            }
        };

        match received {
            Some((index, Ok(artifact))) => {
                let role = sources[index].0;
                relay(role, artifact, out, gate, sink);
            }
            Some((index, Err(_))) => {
                let (role, _) = sources.remove(index);
                debug!("{role} artifact queue closed");
            }
            None => {}
        }
    }
    debug!("Artifact relay exiting");
}

fn relay(
    role: RoleId,
    artifact: Artifact,
    out: &dyn Broadcast,
    gate: &IngressGate,
    sink: Option<&Sender<(RoleId, Artifact)>>,
) {
    if gate.notifications_allowed() {
        if let Some(cmd) = notification(role, &artifact) {
            out.send_to_all(&cmd);
        }
    } else {
        debug!("Holding back notification for {}", artifact.filename);
    }

    if let Some(sink) = sink {
        if sink.send((role, artifact)).is_err() {
            debug!("Artifact sink dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::unbounded;

    use super::*;
    use crate::dark::DarkCaptureProgress;
    use crate::dispatch::testing::Recorder;
    use plumelink_shared::Value;

    fn image(name: &str, meta: bool) -> Artifact {
        Artifact {
            filename: format!("{name}.png"),
            payload: vec![1, 2, 3],
            metadata: meta.then(|| (format!("{name}.json"), b"{}".to_vec())),
        }
    }

    #[test]
    fn camera_notification_carries_metadata() {
        let cmd = notification(RoleId::CameraB, &image("x", true)).unwrap();
        assert_eq!(cmd.source(), RoleId::Orchestrator);
        assert_eq!(cmd.get(Code::NIB), Some(&Value::Str("x.png".into())));
        assert_eq!(cmd.get(Code::NMB), Some(&Value::Str("x.json".into())));
        assert_eq!(cmd.destination(), Some(vec![RoleId::External]));
        assert!(notification(RoleId::External, &image("x", false)).is_none());
    }

    #[test]
    fn relays_until_queues_close() {
        let (cam_tx, cam_rx) = unbounded();
        let (spec_tx, spec_rx) = unbounded();
        let (sink_tx, sink_rx) = unbounded();
        let out = Arc::new(Recorder::default());
        let gate = Arc::new(IngressGate::new(
            Arc::new(DarkCaptureProgress::new()),
            Duration::from_secs(10),
        ));

        let relay = ArtifactRelay::spawn(
            vec![(RoleId::CameraA, cam_rx), (RoleId::Spectrometer, spec_rx)],
            out.clone(),
            gate.clone(),
            Some(sink_tx),
            Duration::from_millis(10),
        )
        .unwrap();

        cam_tx.send(image("a", true)).unwrap();
        let (role, art) = sink_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((role, art.filename.as_str()), (RoleId::CameraA, "a.png"));

        // Held back while a status request is being answered
        gate.open_pause();
        spec_tx
            .send(Artifact {
                filename: "s.npy".into(),
                payload: Vec::new(),
                metadata: None,
            })
            .unwrap();
        sink_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        drop(cam_tx);
        drop(spec_tx);
        relay.join();

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(Code::NIA));
        assert!(sent[0].contains(Code::NMA));
    }
}
