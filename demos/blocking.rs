use anyhow::Result;
use axidma::{AxiDma, Direction};

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let dma = AxiDma::new()?;
    println!("{:?}", dma);

    let tx_channel = *dma
        .dma_tx()
        .first()
        .ok_or_else(|| anyhow::anyhow!("no transmit channel"))?;
    let rx_channel = *dma
        .dma_rx()
        .first()
        .ok_or_else(|| anyhow::anyhow!("no receive channel"))?;

    let items = 1024;
    let tx_buffer = dma.malloc(items * 4)?;
    let rx_buffer = dma.malloc(items * 4)?;
    println!("{:?}", tx_buffer);
    println!("{:?}", rx_buffer);

    let tx = tx_buffer.slice::<u32>();
    let rx = rx_buffer.slice::<u32>();
    for i in rx.iter_mut() {
        *i = 0;
    }
    for i in tx.iter_mut() {
        *i = fastrand::u32(0..1024);
    }

    dma.twoway_transfer(
        tx_channel,
        &tx_buffer,
        items * 4,
        rx_channel,
        &rx_buffer,
        items * 4,
        true,
    )?;
    println!("read-write done");

    let mismatches = tx.iter().zip(rx.iter()).filter(|(a, b)| a != b).count();
    println!("{} of {} words differ after loopback", mismatches, items);

    dma.oneway_transfer(Direction::Write, tx_channel, &tx_buffer, items * 4, true)?;
    println!("write done");

    Ok(())
}
