//! Userspace side of the driver: open the control device, allocate DMA
//! buffers and run transfers.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use zerocopy::FromZeros;

use crate::control::{LocalMemory, Session};
use crate::engine::{ChannelType, Direction, DmaEngine};
use crate::ioctl::{
    self, ChannelArg, ChannelInfoArg, InoutTransactionArg, NumChannelsArg, TransactionArg,
    VideoTransactionArg,
};
use crate::{Config, Error};

mod dma_buffer;
pub use dma_buffer::DmaBuffer;

#[cfg(feature = "async")]
mod notify;
#[cfg(feature = "async")]
pub use notify::NotificationListener;

/// How ioctls and mappings reach the driver.
pub trait Transport: Send + Sync {
    /// `arg` is an address in this process, or a plain value for commands
    /// that take one.
    fn ioctl(&self, cmd: u32, arg: usize) -> Result<(), Error>;
    /// Maps a new DMA buffer of `size` bytes and returns its address.
    fn mmap(&self, size: usize) -> Result<usize, Error>;
    fn munmap(&self, addr: usize, size: usize) -> Result<(), Error>;
}

fn last_error() -> Error {
    Error::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

/// The character device node exposed by the kernel driver.
#[derive(Debug)]
pub struct DevFile {
    dev_fd: File,
}

impl DevFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DevFile, Error> {
        let path = path.as_ref();
        let dev_fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)
            .map_err(|e| {
                error!("expected the AXI DMA device at {}: {}", path.display(), e);
                e
            })?;
        Ok(DevFile { dev_fd })
    }
}

impl Transport for DevFile {
    fn ioctl(&self, cmd: u32, arg: usize) -> Result<(), Error> {
        let rc = unsafe { libc::ioctl(self.dev_fd.as_raw_fd(), cmd as _, arg) };
        if rc < 0 {
            return Err(last_error());
        }
        Ok(())
    }

    fn mmap(&self, size: usize) -> Result<usize, Error> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.dev_fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(last_error());
        }
        Ok(addr as usize)
    }

    fn munmap(&self, addr: usize, size: usize) -> Result<(), Error> {
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
        if rc < 0 {
            return Err(last_error());
        }
        Ok(())
    }
}

/// An in-process control device session.
impl<E: DmaEngine> Transport for Session<E> {
    fn ioctl(&self, cmd: u32, arg: usize) -> Result<(), Error> {
        // arguments come from this process's own address space
        let mem = unsafe { LocalMemory::new() };
        Session::ioctl(self, cmd, arg, &mem)
    }

    fn mmap(&self, size: usize) -> Result<usize, Error> {
        Session::mmap(self, size).map(|region| region.user_addr)
    }

    fn munmap(&self, addr: usize, _size: usize) -> Result<(), Error> {
        Session::munmap(self, addr)
    }
}

/// Handle on the AXI DMA driver, with the channels it reported at open time.
pub struct AxiDma<T: Transport = DevFile> {
    transport: Arc<T>,
    dma_tx: Vec<i32>,
    dma_rx: Vec<i32>,
    vdma_tx: Vec<i32>,
    vdma_rx: Vec<i32>,
}

impl<T: Transport> fmt::Debug for AxiDma<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AxiDma")?;
        writeln!(f, "  dma_tx: {:?}", &self.dma_tx)?;
        writeln!(f, "  dma_rx: {:?}", &self.dma_rx)?;
        writeln!(f, "  vdma_tx: {:?}", &self.vdma_tx)?;
        write!(f, "  vdma_rx: {:?}", &self.vdma_rx)
    }
}

impl AxiDma<DevFile> {
    /// Opens the device at the default path.
    pub fn new() -> Result<AxiDma<DevFile>, Error> {
        AxiDma::open(Config::default().device_path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<AxiDma<DevFile>, Error> {
        AxiDma::with_transport(DevFile::open(path)?)
    }
}

impl<T: Transport> AxiDma<T> {
    /// Queries the driver for its channels and sorts them by type and direction.
    pub fn with_transport(transport: T) -> Result<AxiDma<T>, Error> {
        let mut dev = AxiDma {
            transport: Arc::new(transport),
            dma_tx: Vec::new(),
            dma_rx: Vec::new(),
            vdma_tx: Vec::new(),
            vdma_rx: Vec::new(),
        };
        dev.probe_channels()?;
        info!(
            "AXI DMA: {} DMA tx, {} DMA rx, {} VDMA tx, {} VDMA rx channels",
            dev.dma_tx.len(),
            dev.dma_rx.len(),
            dev.vdma_tx.len(),
            dev.vdma_rx.len()
        );
        Ok(dev)
    }

    fn probe_channels(&mut self) -> Result<(), Error> {
        let mut num = NumChannelsArg::default();
        self.transport
            .ioctl(ioctl::GET_NUM_DMA_CHANNELS, &mut num as *mut _ as usize)?;
        if num.num_channels <= 0 {
            error!("no DMA channels are present");
            return Err(Error::NoSuchDevice);
        }

        let mut channels = vec![ChannelArg::new_zeroed(); num.num_channels as usize];
        let info = ChannelInfoArg {
            channels: channels.as_mut_ptr() as usize,
        };
        self.transport
            .ioctl(ioctl::GET_DMA_CHANNELS, &info as *const _ as usize)?;

        for chan in &channels {
            let (ty, dir) = match (ChannelType::from_raw(chan.ty), Direction::from_raw(chan.dir)) {
                (Some(ty), Some(dir)) => (ty, dir),
                _ => {
                    warn!("ignoring channel {} with unknown type or direction", chan.channel_id);
                    continue;
                }
            };
            self.ids_mut(ty, dir).push(chan.channel_id);
        }
        Ok(())
    }

    fn ids_mut(&mut self, ty: ChannelType, dir: Direction) -> &mut Vec<i32> {
        match (ty, dir) {
            (ChannelType::Dma, Direction::Write) => &mut self.dma_tx,
            (ChannelType::Dma, Direction::Read) => &mut self.dma_rx,
            (ChannelType::Vdma, Direction::Write) => &mut self.vdma_tx,
            (ChannelType::Vdma, Direction::Read) => &mut self.vdma_rx,
        }
    }

    fn ids(&self, ty: ChannelType, dir: Direction) -> &[i32] {
        match (ty, dir) {
            (ChannelType::Dma, Direction::Write) => &self.dma_tx,
            (ChannelType::Dma, Direction::Read) => &self.dma_rx,
            (ChannelType::Vdma, Direction::Write) => &self.vdma_tx,
            (ChannelType::Vdma, Direction::Read) => &self.vdma_rx,
        }
    }

    fn check_channel(&self, channel: i32, ty: ChannelType, dir: Direction) -> Result<(), Error> {
        if self.ids(ty, dir).contains(&channel) {
            Ok(())
        } else {
            warn!("{} is not a {} {} channel", channel, ty, dir);
            Err(Error::NoSuchDevice)
        }
    }

    fn check_len(buf: &DmaBuffer<T>, len: usize) -> Result<(), Error> {
        if len == 0 || len > buf.size() {
            warn!(
                "transfer length {:#x} does not fit buffer of size {:#x}",
                len,
                buf.size()
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dma_tx(&self) -> &[i32] {
        &self.dma_tx
    }

    pub fn dma_rx(&self) -> &[i32] {
        &self.dma_rx
    }

    pub fn vdma_tx(&self) -> &[i32] {
        &self.vdma_tx
    }

    pub fn vdma_rx(&self) -> &[i32] {
        &self.vdma_rx
    }

    /// Allocates a DMA buffer. Expensive, best done once at start-up.
    pub fn malloc(&self, size: usize) -> Result<DmaBuffer<T>, Error> {
        DmaBuffer::new(self.transport.clone(), size)
    }

    /// Transfers the first `len` bytes of `buf` in one direction.
    pub fn oneway_transfer(
        &self,
        dir: Direction,
        channel: i32,
        buf: &DmaBuffer<T>,
        len: usize,
        wait: bool,
    ) -> Result<(), Error> {
        self.check_channel(channel, ChannelType::Dma, dir)?;
        Self::check_len(buf, len)?;
        let trans = TransactionArg::new(channel, buf.addr(), len, wait);
        let cmd = match dir {
            Direction::Read => ioctl::DMA_READ,
            Direction::Write => ioctl::DMA_WRITE,
        };
        self.transport
            .ioctl(cmd, &trans as *const _ as usize)
            .map_err(|e| {
                error!("failed to perform the AXI DMA transfer: {}", e);
                e
            })
    }

    /// Sends `tx_len` bytes of `tx_buf` and receives `rx_len` bytes into `rx_buf`.
    #[allow(clippy::too_many_arguments)]
    pub fn twoway_transfer(
        &self,
        tx_channel: i32,
        tx_buf: &DmaBuffer<T>,
        tx_len: usize,
        rx_channel: i32,
        rx_buf: &DmaBuffer<T>,
        rx_len: usize,
        wait: bool,
    ) -> Result<(), Error> {
        self.check_channel(tx_channel, ChannelType::Dma, Direction::Write)?;
        self.check_channel(rx_channel, ChannelType::Dma, Direction::Read)?;
        Self::check_len(tx_buf, tx_len)?;
        Self::check_len(rx_buf, rx_len)?;
        let trans = InoutTransactionArg::new(
            tx_channel,
            (tx_buf.addr(), tx_len),
            rx_channel,
            (rx_buf.addr(), rx_len),
            wait,
        );
        self.transport
            .ioctl(ioctl::DMA_READWRITE, &trans as *const _ as usize)
            .map_err(|e| {
                error!("failed to perform the AXI DMA read-write transfer: {}", e);
                e
            })
    }

    /// Starts streaming `frames` to a VDMA channel. Never blocks; the stream
    /// runs until [`AxiDma::stop_transfer`].
    pub fn video_transfer(
        &self,
        display_channel: i32,
        width: usize,
        height: usize,
        depth: usize,
        frames: &[&DmaBuffer<T>],
    ) -> Result<(), Error> {
        self.check_channel(display_channel, ChannelType::Vdma, Direction::Write)?;
        let frame_size = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(depth))
            .ok_or(Error::InvalidArgument)?;
        for frame in frames {
            Self::check_len(frame, frame_size)?;
        }
        let addrs: Vec<usize> = frames.iter().map(|f| f.addr()).collect();
        let trans = VideoTransactionArg {
            channel_id: display_channel,
            num_frame_buffers: i32::try_from(addrs.len()).map_err(|_| Error::InvalidArgument)?,
            frame_buffers: addrs.as_ptr() as usize,
            width,
            height,
            depth,
        };
        self.transport
            .ioctl(ioctl::DMA_VIDEO_WRITE, &trans as *const _ as usize)
            .map_err(|e| {
                error!("failed to perform the AXI DMA video write transfer: {}", e);
                e
            })
    }

    /// Stops everything running on a channel, including video streams and
    /// non-blocking transfers.
    pub fn stop_transfer(&self, channel: i32, ty: ChannelType, dir: Direction) -> Result<(), Error> {
        self.check_channel(channel, ty, dir)?;
        let chan = ChannelArg::new(channel, ty, dir);
        self.transport
            .ioctl(ioctl::STOP_DMA_CHANNEL, &chan as *const _ as usize)
            .map_err(|e| {
                error!("failed to stop the DMA channel: {}", e);
                e
            })
    }

    /// Chooses the real-time signal sent when a non-blocking transfer completes.
    pub fn set_signal(&self, signal: i32) -> Result<(), Error> {
        let value = usize::try_from(signal).map_err(|_| Error::InvalidArgument)?;
        self.transport.ioctl(ioctl::SET_DMA_SIGNAL, value)
    }
}
