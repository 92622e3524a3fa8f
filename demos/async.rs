use anyhow::Result;
use axidma::{AxiDma, Direction, NotificationListener};

fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    // block the signal before anything else can receive it
    let signal = libc::SIGRTMIN();
    let mut listener = NotificationListener::new(signal)?;

    let dma = AxiDma::new()?;
    dma.set_signal(signal)?;

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
    for i in tx_buffer.slice::<u32>().iter_mut() {
        *i = fastrand::u32(0..1024);
    }

    async_io::block_on(async {
        dma.oneway_transfer(Direction::Read, rx_channel, &rx_buffer, items * 4, false)?;
        dma.oneway_transfer(Direction::Write, tx_channel, &tx_buffer, items * 4, false)?;
        println!("transfers started");

        for _ in 0..2 {
            let channel = listener.next().await?;
            println!("channel {} done", channel);
        }
        Result::<()>::Ok(())
    })?;

    Ok(())
}
