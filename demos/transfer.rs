use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axidma::client::Transport;
use axidma::completion::QueueSink;
use axidma::engine::ChannelDescriptor;
use axidma::sim::{CompletionMode, HeapAllocator, SimEngine};
use axidma::{
    AxiDma, AxiDmaDevice, ChannelType, Config, ControlDevice, Credentials, Direction, DmaBuffer,
    Session,
};

// idle channels get buffers this many times the input size
const BUF_SCALE: usize = 2;

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 && args.len() != 5 {
        bail!("usage: {} <input path> <output path> [<tx channel> <rx channel>]", args[0]);
    }
    let channels = match args.get(3..5) {
        Some([tx, rx]) => Some((tx.parse::<i32>()?, rx.parse::<i32>()?)),
        _ => None,
    };

    match AxiDma::new() {
        Ok(dma) => transfer_file(&dma, &args[1], &args[2], channels),
        Err(e) => {
            println!("no AXI DMA device ({}), using the simulator", e);
            let dma = simulator()?;
            transfer_file(&dma, &args[1], &args[2], channels)
        }
    }
}

fn transfer_file<T: Transport>(
    dma: &AxiDma<T>,
    input: &str,
    output: &str,
    channels: Option<(i32, i32)>,
) -> Result<()> {
    let (tx_channel, rx_channel) = match channels {
        Some(c) => c,
        None => (
            *dma.dma_tx().first().context("no transmit channel")?,
            *dma.dma_rx().first().context("no receive channel")?,
        ),
    };

    let data = fs::read(input).with_context(|| format!("reading {}", input))?;
    if data.is_empty() {
        bail!("{} is empty", input);
    }
    let size = data.len();

    let tx_buffer = dma.malloc(size)?;
    let rx_buffer = dma.malloc(size)?;
    tx_buffer.slice::<u8>().copy_from_slice(&data);

    // keep the other channels busy so that nothing stalls the main pair
    let idle_tx = start_idle(dma, Direction::Write, dma.dma_tx(), tx_channel, size)?;
    let idle_rx = start_idle(dma, Direction::Read, dma.dma_rx(), rx_channel, size)?;

    let result = dma.twoway_transfer(
        tx_channel,
        &tx_buffer,
        size,
        rx_channel,
        &rx_buffer,
        size,
        true,
    );

    stop_idle(dma, Direction::Read, idle_rx);
    stop_idle(dma, Direction::Write, idle_tx);
    result.context("DMA read write transaction failed")?;

    fs::write(output, rx_buffer.slice::<u8>()).with_context(|| format!("writing {}", output))?;
    println!(
        "sent {} bytes on channel {}, received into {} on channel {}",
        size, tx_channel, output, rx_channel
    );
    Ok(())
}

fn start_idle<T: Transport>(
    dma: &AxiDma<T>,
    dir: Direction,
    channels: &[i32],
    skip: i32,
    size: usize,
) -> Result<Vec<(i32, DmaBuffer<T>)>> {
    let mut started = Vec::new();
    for &channel in channels.iter().filter(|&&c| c != skip) {
        let buffer = dma.malloc(size * BUF_SCALE)?;
        match dma.oneway_transfer(dir, channel, &buffer, size * BUF_SCALE, false) {
            Ok(()) => started.push((channel, buffer)),
            Err(e) => println!("warning: unable to start transaction on channel {}: {}", channel, e),
        }
    }
    Ok(started)
}

fn stop_idle<T: Transport>(dma: &AxiDma<T>, dir: Direction, started: Vec<(i32, DmaBuffer<T>)>) {
    for (channel, _buffer) in started {
        if let Err(e) = dma.stop_transfer(channel, ChannelType::Dma, dir) {
            println!("warning: unable to stop channel {}: {}", channel, e);
        }
    }
}

fn simulator() -> Result<AxiDma<Session<SimEngine>>> {
    let heap = Arc::new(HeapAllocator::new());
    let engine = SimEngine::loopback(
        vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx_channel"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx_channel"),
            ChannelDescriptor::new(2, ChannelType::Dma, Direction::Write, "idle_tx"),
            ChannelDescriptor::new(3, ChannelType::Dma, Direction::Read, "idle_rx"),
        ],
        heap.clone(),
    );
    for (id, dir) in [(2, Direction::Write), (3, Direction::Read)] {
        if let Some(channel) = engine.channel(id, ChannelType::Dma, dir) {
            channel.set_completion(CompletionMode::Never);
        }
    }
    let (sink, _notifications) = QueueSink::new();
    let device = AxiDmaDevice::new(engine, heap, Arc::new(sink), Config::default())?;
    let control = ControlDevice::new(device);
    let session = control.open(Credentials {
        admin: true,
        exclusive: true,
        pid: std::process::id() as i32,
    })?;
    Ok(AxiDma::with_transport(session)?)
}
