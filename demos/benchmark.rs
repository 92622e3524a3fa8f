use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use axidma::client::Transport;
use axidma::completion::QueueSink;
use axidma::engine::ChannelDescriptor;
use axidma::sim::{HeapAllocator, SimEngine};
use axidma::{
    AxiDma, AxiDmaDevice, ChannelType, Config, ControlDevice, Credentials, Direction, Session,
};

// one 1080p frame of 32 bit pixels
const DEFAULT_TRANSFER_SIZE: usize = 1920 * 1080 * 4;
const DEFAULT_NUM_TRANSFERS: usize = 1000;
const SIM_NUM_TRANSFERS: usize = 10;

fn test_pattern(i: usize) -> u32 {
    0x1234_acde ^ i as u32
}

fn mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Warn)?;

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 3 {
        bail!("usage: {} [<transfer size in MiB>] [<number of transfers>]", args[0]);
    }
    let size = match args.get(1) {
        Some(s) => (s.parse::<f64>()? * 1024.0 * 1024.0) as usize,
        None => DEFAULT_TRANSFER_SIZE,
    };
    let count = args.get(2).map(|s| s.parse::<usize>()).transpose()?;
    if size < 4 {
        bail!("transfer size must be at least one word");
    }

    match AxiDma::new() {
        Ok(dma) => benchmark(&dma, size, count.unwrap_or(DEFAULT_NUM_TRANSFERS)),
        Err(e) => {
            println!("no AXI DMA device ({}), using the simulator", e);
            let dma = simulator()?;
            benchmark(&dma, size, count.unwrap_or(SIM_NUM_TRANSFERS))
        }
    }
}

fn benchmark<T: Transport>(dma: &AxiDma<T>, size: usize, count: usize) -> Result<()> {
    let tx_channel = *dma.dma_tx().first().context("no transmit channel")?;
    let rx_channel = *dma.dma_rx().first().context("no receive channel")?;
    let size = size & !3;
    let words = size / 4;

    println!("AXI DMA benchmark");
    println!("  transfer size: {:.2} MiB", mib(size));
    println!("  transfers: {}", count);
    println!("  channels: tx {}, rx {}", tx_channel, rx_channel);

    let tx_buffer = dma.malloc(size)?;
    let rx_buffer = dma.malloc(size)?;
    let tx = tx_buffer.slice::<u32>();
    let rx = rx_buffer.slice::<u32>();
    for (i, w) in tx.iter_mut().enumerate() {
        *w = test_pattern(i);
    }
    for w in rx.iter_mut() {
        *w = fastrand::u32(..);
    }

    dma.twoway_transfer(tx_channel, &tx_buffer, size, rx_channel, &rx_buffer, size, true)?;

    if let Some(i) = (0..words).find(|&i| tx[i] != test_pattern(i)) {
        bail!(
            "transmit buffer overwritten at word {}: expected {:#010x}, found {:#010x}",
            i,
            test_pattern(i),
            tx[i]
        );
    }
    let matching = (0..words).filter(|&i| rx[i] == test_pattern(i)).count();
    if matching == 0 {
        bail!("receive buffer was not updated");
    }
    if matching < words {
        println!(
            "warning: only {:.2}% of the receive buffer matches the transmit buffer",
            100.0 * matching as f64 / words as f64
        );
    }
    println!("single transfer verified");

    let start = Instant::now();
    for i in 0..count {
        dma.twoway_transfer(tx_channel, &tx_buffer, size, rx_channel, &rx_buffer, size, true)
            .with_context(|| format!("transfer {} failed", i))?;
    }
    let elapsed = start.elapsed().as_secs_f64();

    let rate = mib(size) * count as f64 / elapsed;
    println!("DMA timing");
    println!("  elapsed: {:.2} s", elapsed);
    println!("  transmit: {:.2} MiB/s", rate);
    println!("  receive: {:.2} MiB/s", rate);
    println!("  total: {:.2} MiB/s", 2.0 * rate);

    Ok(())
}

fn simulator() -> Result<AxiDma<Session<SimEngine>>> {
    let heap = Arc::new(HeapAllocator::new());
    let engine = SimEngine::loopback(
        vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx_channel"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx_channel"),
        ],
        heap.clone(),
    );
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
