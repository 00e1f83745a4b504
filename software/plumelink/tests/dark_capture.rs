use std::time::{Duration, Instant};

use crossbeam::channel::unbounded;

use plumelink::{
    ClientLink, Code, CommandSet, Devices, ExitReason, Instrument, InstrumentCtx, MockConfig,
    RoleId, Value,
};

fn mocks(sweep: Vec<i64>, gap_ms: u64) -> Devices {
    Devices::Mock(MockConfig {
        camera_sweep: sweep.clone(),
        spectrometer_sweep: sweep,
        frame_gap: Duration::from_millis(gap_ms),
        ..MockConfig::default()
    })
}

fn position(log: &[CommandSet], from: RoleId, code: Code) -> Option<usize> {
    log.iter()
        .position(|c| c.source() == from && c.get(code) == Some(&Value::Bool(true)))
}

#[test]
fn exit_refused_until_darks_complete() {
    let mut ctx = InstrumentCtx::loopback();
    ctx.exit_when_dark_complete = true;
    let (sink_tx, sink_rx) = unbounded();
    let instrument = Instrument::start(&ctx, mocks(vec![1, 2, 3, 4, 5], 40), Some(sink_tx)).unwrap();
    let dark = instrument.router().gate().dark().clone();
    let client = ClientLink::connect(instrument.local_addr(), RoleId::External, &ctx, true).unwrap();

    client
        .send(CommandSet::new().with(Code::DKC, true).with(Code::DKS, true))
        .unwrap();
    let start = Instant::now();
    while !dark.is_running() {
        assert!(start.elapsed() < Duration::from_secs(2), "dark capture never started");
        std::thread::sleep(Duration::from_millis(2));
    }
    client.send(CommandSet::new().with(Code::EXT, true)).unwrap();

    let mut log = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match client.recv_timeout(Duration::from_millis(100)) {
            Some(cmd) => {
                let bye = cmd.contains(Code::GBY);
                log.push(cmd);
                if bye {
                    break;
                }
            }
            None if !client.is_connected() => break,
            None => {}
        }
    }

    let bye = log
        .iter()
        .position(|c| c.contains(Code::GBY))
        .expect("instrument never said goodbye");
    for (role, code) in [
        (RoleId::CameraA, Code::DFC),
        (RoleId::CameraB, Code::DFC),
        (RoleId::Spectrometer, Code::DFS),
    ] {
        let done = position(&log, role, code).unwrap_or_else(|| panic!("no {code} from {role}"));
        assert!(done < bye, "{role} finished after goodbye");
    }
    assert!(position(&log, RoleId::CameraA, Code::DKC).is_some());
    assert!(position(&log, RoleId::Spectrometer, Code::DKS).is_some());

    // Dark frames are captured but not announced
    assert!(log.iter().all(|c| !c.contains(Code::NIA) && !c.contains(Code::NIS)));
    assert_eq!(instrument.wait(), ExitReason::Exit);

    let frames = sink_rx.try_iter().collect::<Vec<_>>();
    assert_eq!(frames.len(), 15);
    assert!(frames.iter().all(|(_, a)| a.filename.contains("_Dark.")));
}

#[test]
fn forced_exit_interrupts_dark_capture() {
    let ctx = InstrumentCtx::loopback();
    let instrument = Instrument::start(&ctx, mocks(vec![1; 200], 20), None).unwrap();
    let dark = instrument.router().gate().dark().clone();
    let client = ClientLink::connect(instrument.local_addr(), RoleId::External, &ctx, true).unwrap();

    client.send(CommandSet::new().with(Code::DKC, true)).unwrap();
    let start = Instant::now();
    while !dark.is_running() {
        assert!(start.elapsed() < Duration::from_secs(2), "dark capture never started");
        std::thread::sleep(Duration::from_millis(2));
    }

    client.send(CommandSet::new().with(Code::DXT, true)).unwrap();
    assert_eq!(instrument.wait(), ExitReason::Exit);
    // Well short of the 4 s the sweep would take
    assert!(start.elapsed() < Duration::from_secs(4));
}
