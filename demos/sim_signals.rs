use std::sync::Arc;

use anyhow::Result;
use axidma::completion::SignalSink;
use axidma::engine::ChannelDescriptor;
use axidma::sim::{HeapAllocator, SimEngine};
use axidma::{
    AxiDma, AxiDmaDevice, ChannelType, Config, ControlDevice, Credentials, Direction,
    NotificationListener,
};

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    // the signal must be blocked before any other thread exists
    let signal = libc::SIGRTMIN() + 1;
    let mut listener = NotificationListener::new(signal)?;

    let engine = SimEngine::new(vec![
        ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx_channel"),
        ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx_channel"),
    ]);
    let device = AxiDmaDevice::new(
        engine,
        HeapAllocator::new(),
        Arc::new(SignalSink),
        Config::default(),
    )?;
    let session = ControlDevice::new(device).open(Credentials {
        admin: true,
        exclusive: true,
        pid: std::process::id() as i32,
    })?;
    let dma = AxiDma::with_transport(session)?;
    dma.set_signal(signal)?;

    let tx_buffer = dma.malloc(4096)?;
    let rx_buffer = dma.malloc(4096)?;

    async_io::block_on(async {
        dma.oneway_transfer(Direction::Write, 0, &tx_buffer, 4096, false)?;
        println!("channel {} done", listener.next().await?);
        dma.oneway_transfer(Direction::Read, 1, &rx_buffer, 4096, false)?;
        println!("channel {} done", listener.next().await?);
        Result::<()>::Ok(())
    })?;

    Ok(())
}
