use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axidma::completion::QueueSink;
use axidma::engine::ChannelDescriptor;
use axidma::sim::{CompletionMode, HeapAllocator, SimEngine};
use axidma::{AxiDma, AxiDmaDevice, ChannelType, Config, ControlDevice, Credentials, Direction};

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let heap = Arc::new(HeapAllocator::new());
    let engine = SimEngine::loopback(
        vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx_channel"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx_channel"),
            ChannelDescriptor::new(2, ChannelType::Vdma, Direction::Write, "display"),
        ],
        heap.clone(),
    );
    let (sink, notifications) = QueueSink::new();
    let config = Config::default().with_timeout(Duration::from_secs(1));
    let device = AxiDmaDevice::new(engine.clone(), heap, Arc::new(sink), config)?;
    let control = ControlDevice::new(device);
    let session = control.open(Credentials {
        admin: true,
        exclusive: true,
        pid: std::process::id() as i32,
    })?;

    let dma = AxiDma::with_transport(session)?;
    println!("{:?}", dma);

    let items = 4096;
    let tx_buffer = dma.malloc(items * 4)?;
    let rx_buffer = dma.malloc(items * 4)?;
    for i in tx_buffer.slice::<u32>().iter_mut() {
        *i = fastrand::u32(..);
    }

    dma.twoway_transfer(0, &tx_buffer, items * 4, 1, &rx_buffer, items * 4, true)?;
    assert_eq!(tx_buffer.slice::<u32>(), rx_buffer.slice::<u32>());
    println!("loopback of {} words ok", items);

    dma.set_signal(libc::SIGRTMIN())?;
    dma.oneway_transfer(Direction::Write, 0, &tx_buffer, items * 4, false)?;
    let n = notifications.recv_timeout(Duration::from_secs(1))?;
    println!("notified: {:?}", n);
    dma.oneway_transfer(Direction::Read, 1, &rx_buffer, items * 4, true)?;

    let (width, height, depth) = (320, 240, 4);
    let frames = [
        dma.malloc(width * height * depth)?,
        dma.malloc(width * height * depth)?,
    ];
    if let Some(display) = engine.channel(2, ChannelType::Vdma, Direction::Write) {
        display.set_completion(CompletionMode::Never);
    }
    dma.video_transfer(2, width, height, depth, &[&frames[0], &frames[1]])?;
    println!("video streaming");
    dma.stop_transfer(2, ChannelType::Vdma, Direction::Write)?;
    println!("video stopped");

    Ok(())
}
