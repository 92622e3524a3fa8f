use std::sync::mpsc::Receiver;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use axidma::client::{DevFile, Transport};
use axidma::completion::{Notification, QueueSink};
use axidma::engine::{ChannelDescriptor, SgEntry};
use axidma::ioctl::{self, NumChannelsArg, VideoTransactionArg};
use axidma::registry::ChannelState;
use axidma::sim::{CompletionMode, HeapAllocator, SimEngine};
use axidma::{
    AxiDma, AxiDmaDevice, ChannelType, Config, ControlDevice, Credentials, Direction, Error,
    Session,
};

struct Rig {
    engine: SimEngine,
    control: Arc<ControlDevice<SimEngine>>,
    notifications: Receiver<Notification>,
    dma: AxiDma<Session<SimEngine>>,
}

fn creds() -> Credentials {
    Credentials {
        admin: true,
        exclusive: true,
        pid: 1000,
    }
}

fn rig(config: Config) -> Rig {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();

    let heap = Arc::new(HeapAllocator::new());
    let engine = SimEngine::loopback(
        vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx0"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx1"),
            ChannelDescriptor::new(2, ChannelType::Dma, Direction::Write, "tx2"),
            ChannelDescriptor::new(3, ChannelType::Dma, Direction::Read, "rx3"),
            ChannelDescriptor::new(8, ChannelType::Vdma, Direction::Write, "display"),
        ],
        heap.clone(),
    );
    let (sink, notifications) = QueueSink::new();
    let device = AxiDmaDevice::new(engine.clone(), heap, Arc::new(sink), config).unwrap();
    let control = ControlDevice::new(device);
    let session = control.open(creds()).unwrap();
    let dma = AxiDma::with_transport(session).unwrap();
    Rig {
        engine,
        control,
        notifications,
        dma,
    }
}

#[test]
fn probe_reports_every_channel() {
    let rig = rig(Config::default());
    assert_eq!(rig.dma.dma_tx(), &[0, 2]);
    assert_eq!(rig.dma.dma_rx(), &[1, 3]);
    assert_eq!(rig.dma.vdma_tx(), &[8]);
    assert!(rig.dma.vdma_rx().is_empty());
}

#[test]
fn write_never_mutates_its_source() {
    let rig = rig(Config::default());
    let dma = &rig.dma;
    let src = dma.malloc(8192).unwrap();
    let dst = dma.malloc(8192).unwrap();
    let pattern: Vec<u8> = (0..8192).map(|_| fastrand::u8(..)).collect();
    src.slice::<u8>().copy_from_slice(&pattern);

    dma.oneway_transfer(Direction::Write, 0, &src, 8192, true)
        .unwrap();
    assert_eq!(src.slice::<u8>(), &pattern[..]);

    dma.oneway_transfer(Direction::Read, 1, &dst, 8192, true)
        .unwrap();
    assert_eq!(dst.slice::<u8>(), &pattern[..]);
    assert_eq!(src.slice::<u8>(), &pattern[..]);
}

#[test]
fn read_write_returns_after_receive_completes() {
    let rig = rig(Config::default());
    let rx_sim = rig
        .engine
        .channel(3, ChannelType::Dma, Direction::Read)
        .unwrap();
    rx_sim.set_completion(CompletionMode::Delayed(Duration::from_millis(100)));
    let tx = rig.dma.malloc(4096).unwrap();
    let rx = rig.dma.malloc(4096).unwrap();
    for v in tx.slice::<u32>().iter_mut() {
        *v = fastrand::u32(..);
    }

    let start = Instant::now();
    rig.dma
        .twoway_transfer(2, &tx, 4096, 3, &rx, 4096, true)
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(rx_sim.in_flight(), 0);
    assert_eq!(tx.slice::<u32>(), rx.slice::<u32>());

    // nothing left on the transmit side, stopping is harmless
    rig.dma
        .stop_transfer(2, ChannelType::Dma, Direction::Write)
        .unwrap();
}

#[test]
fn hung_transfer_times_out_then_stops_immediately() {
    let timeout = Duration::from_millis(200);
    let rig = rig(Config::default().with_timeout(timeout));
    let sim = rig
        .engine
        .channel(1, ChannelType::Dma, Direction::Read)
        .unwrap();
    sim.set_completion(CompletionMode::Never);
    let buf = rig.dma.malloc(512).unwrap();

    let start = Instant::now();
    let result = rig.dma.oneway_transfer(Direction::Read, 1, &buf, 512, true);
    let elapsed = start.elapsed();
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2));

    let start = Instant::now();
    rig.dma
        .stop_transfer(1, ChannelType::Dma, Direction::Read)
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(
        rig.control
            .device()
            .channel_state(1, ChannelType::Dma, Direction::Read)
            .unwrap(),
        ChannelState::Idle
    );
}

#[test]
fn stop_is_idempotent_and_releases_a_waiter() {
    let rig = rig(Config::default());
    rig.dma
        .stop_transfer(0, ChannelType::Dma, Direction::Write)
        .unwrap();
    rig.dma
        .stop_transfer(0, ChannelType::Dma, Direction::Write)
        .unwrap();

    let sim = rig
        .engine
        .channel(0, ChannelType::Dma, Direction::Write)
        .unwrap();
    sim.set_completion(CompletionMode::Never);
    let buf = rig.dma.malloc(256).unwrap();

    let start = Instant::now();
    thread::scope(|s| {
        let waiter =
            s.spawn(|| rig.dma.oneway_transfer(Direction::Write, 0, &buf, 256, true));
        while sim.in_flight() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        rig.dma
            .stop_transfer(0, ChannelType::Dma, Direction::Write)
            .unwrap();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::EngineFailure)));
    });
    assert!(start.elapsed() < Config::default().timeout);
}

#[test]
fn video_write_submits_one_entry_per_frame() {
    let rig = rig(Config::default());
    let sim = rig
        .engine
        .channel(8, ChannelType::Vdma, Direction::Write)
        .unwrap();
    sim.set_completion(CompletionMode::Never);

    let (w, h, d) = (160, 120, 3);
    let frames: Vec<_> = (0..3).map(|_| rig.dma.malloc(w * h * d).unwrap()).collect();
    let refs: Vec<_> = frames.iter().collect();
    rig.dma.video_transfer(8, w, h, d, &refs).unwrap();

    let sg = sim.last_sg().unwrap();
    assert_eq!(sg.len(), 3);
    assert!(sg.iter().all(|e: &SgEntry| e.len == w * h * d));
    assert_eq!(sim.in_flight(), 1);

    rig.dma
        .stop_transfer(8, ChannelType::Vdma, Direction::Write)
        .unwrap();
    assert_eq!(sim.in_flight(), 0);
}

#[test]
fn video_frames_must_hold_a_whole_frame() {
    let rig = rig(Config::default());
    let small = rig.dma.malloc(64).unwrap();
    assert!(matches!(
        rig.dma.video_transfer(8, 16, 16, 4, &[&small]),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn huge_frame_count_is_out_of_memory() {
    let rig = rig(Config::default());
    let frame = rig.dma.malloc(64).unwrap();
    let addrs = [frame.addr()];
    let trans = VideoTransactionArg {
        channel_id: 8,
        num_frame_buffers: i32::MAX,
        frame_buffers: addrs.as_ptr() as usize,
        width: 4,
        height: 4,
        depth: 4,
    };
    assert!(matches!(
        Transport::ioctl(
            rig.dma.transport(),
            ioctl::DMA_VIDEO_WRITE,
            &trans as *const _ as usize
        ),
        Err(Error::OutOfMemory)
    ));
    let sim = rig
        .engine
        .channel(8, ChannelType::Vdma, Direction::Write)
        .unwrap();
    assert_eq!(sim.submitted(), 0);
}

#[test]
fn transfers_on_one_channel_are_serialized() {
    let rig = rig(Config::default());
    let sim = rig
        .engine
        .channel(0, ChannelType::Dma, Direction::Write)
        .unwrap();
    sim.set_completion(CompletionMode::Never);
    let a = rig.dma.malloc(256).unwrap();
    let b = rig.dma.malloc(256).unwrap();

    thread::scope(|s| {
        let first = s.spawn(|| rig.dma.oneway_transfer(Direction::Write, 0, &a, 256, true));
        let second = s.spawn(|| rig.dma.oneway_transfer(Direction::Write, 0, &b, 256, true));

        while sim.submitted() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        // the other caller holds off until the channel is free again
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sim.submitted(), 1);
        assert_eq!(sim.in_flight(), 1);

        rig.dma
            .stop_transfer(0, ChannelType::Dma, Direction::Write)
            .unwrap();
        while sim.submitted() < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        rig.dma
            .stop_transfer(0, ChannelType::Dma, Direction::Write)
            .unwrap();

        assert!(matches!(first.join().unwrap(), Err(Error::EngineFailure)));
        assert!(matches!(second.join().unwrap(), Err(Error::EngineFailure)));
    });
    assert_eq!(sim.in_flight(), 0);
}

#[test]
fn concurrent_channel_queries_agree() {
    let rig = rig(Config::default());
    let threads = 8;
    let barrier = Barrier::new(threads);
    let results: Vec<NumChannelsArg> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let mut num = NumChannelsArg::default();
                    Transport::ioctl(
                        rig.dma.transport(),
                        ioctl::GET_NUM_DMA_CHANNELS,
                        &mut num as *mut _ as usize,
                    )
                    .unwrap();
                    num
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(results.iter().all(|n| *n == results[0]));
    assert_eq!(results[0].num_channels, 5);
    assert_eq!(results[0].num_vdma_tx_channels, 1);
}

#[test]
fn device_is_exclusive_while_open() {
    let rig = rig(Config::default());
    assert!(matches!(rig.control.open(creds()), Err(Error::Busy)));
    let Rig { control, dma, .. } = rig;
    drop(dma);
    assert!(!control.is_open());
    let again = control.open(creds()).unwrap();
    assert!(AxiDma::with_transport(again).is_ok());
}

#[test]
fn unknown_ioctl_is_rejected() {
    let rig = rig(Config::default());
    let bogus = ioctl::ioc(ioctl::IOC_READ, ioctl::IOCTL_MAGIC, 12, 8);
    assert!(matches!(
        Transport::ioctl(rig.dma.transport(), bogus, 0),
        Err(Error::NotTty)
    ));
}

#[test]
fn non_realtime_signal_is_rejected() {
    let rig = rig(Config::default());
    assert!(matches!(
        rig.dma.set_signal(libc::SIGINT),
        Err(Error::InvalidArgument)
    ));
    assert!(rig.dma.set_signal(libc::SIGRTMIN() + 2).is_ok());
}

#[test]
fn non_blocking_completion_is_delivered() {
    let rig = rig(Config::default());
    let signal = libc::SIGRTMIN() + 3;
    rig.dma.set_signal(signal).unwrap();
    let buf = rig.dma.malloc(1024).unwrap();
    rig.dma
        .oneway_transfer(Direction::Write, 2, &buf, 1024, false)
        .unwrap();
    let n = rig
        .notifications
        .recv_timeout(Duration::from_secs(1))
        .unwrap();
    assert_eq!(n.channel_id, 2);
    assert_eq!(n.signal, signal);
    assert_eq!(n.pid, 1000);
}

#[test]
fn buffers_outside_any_mapping_fault() {
    let rig = rig(Config::default());
    let mut local = vec![0u8; 256];
    let trans = ioctl::TransactionArg::new(0, local.as_mut_ptr() as usize, 256, true);
    assert!(matches!(
        Transport::ioctl(
            rig.dma.transport(),
            ioctl::DMA_WRITE,
            &trans as *const _ as usize
        ),
        Err(Error::Fault)
    ));
}

#[test]
fn missing_device_node_is_an_io_error() {
    assert!(matches!(
        DevFile::open("/nonexistent/axidma"),
        Err(Error::Io(_))
    ));
}
