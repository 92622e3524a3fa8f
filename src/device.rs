//! The transfer orchestrator: one driver instance over one DMA engine.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use crate::buffer::{self, BufferTable, CoherentAllocator, CoherentRegion};
use crate::completion::{self, valid_notify_signal, NotifySink};
use crate::descriptor::{self, NotifyTarget, TransferKind, TransferRequest, UserBuffer};
use crate::engine::{ChannelType, Direction, DmaEngine};
use crate::registry::{ChannelInfo, ChannelRegistry, ChannelState, NumChannels};
use crate::{Config, Error};

/// No notification signal configured.
const NO_SIGNAL: i32 = -1;

pub struct AxiDmaDevice<E: DmaEngine> {
    config: Config,
    registry: ChannelRegistry<E>,
    buffers: BufferTable,
    allocator: Box<dyn CoherentAllocator>,
    sink: Arc<dyn NotifySink>,
    notify_signal: AtomicI32,
    owner: AtomicI32,
}

impl<E: DmaEngine> fmt::Debug for AxiDmaDevice<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AxiDmaDevice ({})", &self.config.chrdev_name)?;
        writeln!(f, "  channels: {:?}", &self.registry.num_channels())?;
        writeln!(f, "  buffers: {}", self.buffers.len())?;
        write!(f, "  signal: {}", self.notify_signal.load(Ordering::Relaxed))
    }
}

impl<E: DmaEngine> AxiDmaDevice<E> {
    /// Reserves the engine's channels and sets up an empty buffer table.
    pub fn new<A>(
        engine: E,
        allocator: A,
        sink: Arc<dyn NotifySink>,
        config: Config,
    ) -> Result<AxiDmaDevice<E>, Error>
    where
        A: CoherentAllocator + 'static,
    {
        let registry = ChannelRegistry::initialize(engine, &config)?;
        info!("{} device ready", config.chrdev_name);
        Ok(AxiDmaDevice {
            config,
            registry,
            buffers: BufferTable::new(),
            allocator: Box::new(allocator),
            sink,
            notify_signal: AtomicI32::new(NO_SIGNAL),
            owner: AtomicI32::new(std::process::id() as i32),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry<E> {
        &self.registry
    }

    pub fn buffers(&self) -> &BufferTable {
        &self.buffers
    }

    pub fn num_channels(&self) -> NumChannels {
        self.registry.num_channels()
    }

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.registry.channels().collect()
    }

    pub fn channel_state(
        &self,
        channel_id: i32,
        ty: ChannelType,
        dir: Direction,
    ) -> Result<ChannelState, Error> {
        Ok(self.registry.lookup(channel_id, ty, dir)?.state())
    }

    /// Sets the real-time signal sent when a non-blocking transfer completes.
    pub fn set_signal(&self, signal: i32) -> Result<(), Error> {
        if !valid_notify_signal(signal) {
            error!(
                "invalid signal {}, must be a real-time signal ({}..={})",
                signal,
                libc::SIGRTMIN(),
                libc::SIGRTMAX()
            );
            return Err(Error::InvalidArgument);
        }
        self.notify_signal.store(signal, Ordering::Release);
        Ok(())
    }

    pub fn notify_signal(&self) -> Option<i32> {
        match self.notify_signal.load(Ordering::Acquire) {
            NO_SIGNAL => None,
            signal => Some(signal),
        }
    }

    /// Process that receives completion notifications.
    pub fn set_owner(&self, pid: i32) {
        self.owner.store(pid, Ordering::Release);
    }

    pub fn owner(&self) -> i32 {
        self.owner.load(Ordering::Acquire)
    }

    fn notify_target(&self) -> NotifyTarget {
        NotifyTarget {
            pid: self.owner(),
            signal: self.notify_signal.load(Ordering::Acquire),
            sink: self.sink.clone(),
        }
    }

    /// Allocates a DMA-coherent region and registers its mapping.
    pub fn mmap(&self, size: usize) -> Result<CoherentRegion, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let region = self.allocator.alloc(size).map_err(|e| {
            error!(
                "unable to allocate contiguous DMA memory region of size {}",
                size
            );
            e
        })?;
        if let Err(e) = self.buffers.insert(region) {
            self.allocator.free(&region);
            return Err(e);
        }
        Ok(region)
    }

    /// Unregisters the mapping starting at `user_addr` and frees its memory.
    pub fn munmap(&self, user_addr: usize) -> Result<(), Error> {
        let region = self.buffers.remove(user_addr).ok_or_else(|| {
            warn!("no DMA mapping starts at {:#x}", user_addr);
            Error::InvalidArgument
        })?;
        self.allocator.free(&region);
        Ok(())
    }

    /// Runs one transfer on one channel.
    pub fn transfer(&self, request: &TransferRequest<'_>) -> Result<(), Error> {
        let channel =
            self.registry
                .lookup(request.channel_id, request.kind.channel_type(), request.dir)?;
        let _busy = channel.lock();
        let ctx = descriptor::prepare(channel, &self.buffers, request, self.notify_target())?;
        completion::start_and_wait(ctx, self.config.timeout)
    }

    /// Receives `len` bytes from the fabric into the buffer at `addr`.
    pub fn read(&self, channel_id: i32, addr: usize, len: usize, wait: bool) -> Result<(), Error> {
        self.transfer(&TransferRequest {
            channel_id,
            dir: Direction::Read,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &[UserBuffer::new(addr, len)],
            wait,
        })
    }

    /// Sends `len` bytes from the buffer at `addr` to the fabric.
    pub fn write(&self, channel_id: i32, addr: usize, len: usize, wait: bool) -> Result<(), Error> {
        self.transfer(&TransferRequest {
            channel_id,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &[UserBuffer::new(addr, len)],
            wait,
        })
    }

    /// Sends `tx` and receives into `rx`.
    ///
    /// Both sides are submitted and issued before anything is awaited, and
    /// only the receive side honours `wait`. If either side fails, the other
    /// is terminated, including when the receive side times out or fails
    /// after the transmit side was started.
    pub fn read_write(
        &self,
        tx_channel: i32,
        tx: UserBuffer,
        rx_channel: i32,
        rx: UserBuffer,
        wait: bool,
    ) -> Result<(), Error> {
        let tx_chan = self
            .registry
            .lookup(tx_channel, ChannelType::Dma, Direction::Write)?;
        let rx_chan = self
            .registry
            .lookup(rx_channel, ChannelType::Dma, Direction::Read)?;

        // transmit before receive, everywhere
        let _tx_busy = tx_chan.lock();
        let _rx_busy = rx_chan.lock();

        let tx_buffers = [tx];
        let tx_request = TransferRequest {
            channel_id: tx_channel,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &tx_buffers,
            wait: false,
        };
        let rx_buffers = [rx];
        let rx_request = TransferRequest {
            channel_id: rx_channel,
            dir: Direction::Read,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &rx_buffers,
            wait,
        };

        let tx_ctx = descriptor::prepare(tx_chan, &self.buffers, &tx_request, self.notify_target())?;
        let rx_ctx = descriptor::prepare(rx_chan, &self.buffers, &rx_request, self.notify_target())?;

        completion::start_and_wait(tx_ctx, self.config.timeout)?;
        completion::start_and_wait(rx_ctx, self.config.timeout).map_err(|e| {
            if let Err(stop) = tx_chan.terminate() {
                warn!("unable to stop transmit channel {}: {}", tx_channel, stop);
            }
            e
        })
    }

    /// Streams `frame_buffers` to a VDMA channel until stopped.
    ///
    /// Every frame buffer holds `width * height * depth` bytes. Never blocks.
    pub fn video_write(
        &self,
        channel_id: i32,
        frame_buffers: &[usize],
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<(), Error> {
        if frame_buffers.is_empty() {
            error!("video transfer needs at least one frame buffer");
            return Err(Error::InvalidArgument);
        }
        let kind = TransferKind::Vdma {
            width,
            height,
            depth,
        };
        let frame_size = kind
            .frame_size()
            .filter(|&size| size > 0)
            .ok_or(Error::InvalidArgument)?;
        let mut buffers = buffer::list_with_capacity(frame_buffers.len())?;
        buffers.extend(
            frame_buffers
                .iter()
                .map(|&addr| UserBuffer::new(addr, frame_size)),
        );

        self.transfer(&TransferRequest {
            channel_id,
            dir: Direction::Write,
            kind,
            buffers: &buffers,
            wait: false,
        })
    }

    /// Terminates everything on the channel. Stopping an idle channel is fine.
    pub fn stop(&self, channel_id: i32, ty: ChannelType, dir: Direction) -> Result<(), Error> {
        let channel = self.registry.lookup(channel_id, ty, dir)?;
        channel.terminate().map_err(|e| {
            error!("unable to stop {} {} channel {}: {}", ty, dir, channel_id, e);
            Error::Engine(e)
        })
    }
}

impl<E: DmaEngine> Drop for AxiDmaDevice<E> {
    fn drop(&mut self) {
        // the engine must be quiet before its memory goes away
        self.registry.terminate_all();
        for region in self.buffers.drain() {
            self.allocator.free(&region);
        }
    }
}
