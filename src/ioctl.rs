//! Command numbers and argument layouts of the `/dev/axidma` ioctl interface.
//!
//! Layouts follow the C ABI of the device's existing clients: field order,
//! sizes and padding must not change.

use std::mem::size_of;

use log::error;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::engine::{ChannelType, Direction};
use crate::registry::{ChannelInfo, NumChannels};
use crate::Error;

pub const IOCTL_MAGIC: u8 = b'W';

/// Number of commands; command numbers are `0..NUM_IOCTLS`.
pub const NUM_IOCTLS: u32 = 8;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

pub const IOC_NONE: u32 = 0;
pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

pub const fn ioc(dir: u32, ty: u8, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

const fn io(nr: u32) -> u32 {
    ioc(IOC_NONE, IOCTL_MAGIC, nr, 0)
}

const fn ior(nr: u32, size: usize) -> u32 {
    ioc(IOC_READ, IOCTL_MAGIC, nr, size)
}

const fn iow(nr: u32, size: usize) -> u32 {
    ioc(IOC_WRITE, IOCTL_MAGIC, nr, size)
}

pub fn ioc_dir(cmd: u32) -> u32 {
    cmd >> IOC_DIRSHIFT
}

pub fn ioc_type(cmd: u32) -> u8 {
    ((cmd >> IOC_TYPESHIFT) & ((1 << IOC_TYPEBITS) - 1)) as u8
}

pub fn ioc_nr(cmd: u32) -> u32 {
    (cmd >> IOC_NRSHIFT) & ((1 << IOC_NRBITS) - 1)
}

pub fn ioc_size(cmd: u32) -> usize {
    ((cmd >> IOC_SIZESHIFT) & ((1 << IOC_SIZEBITS) - 1)) as usize
}

pub const GET_NUM_DMA_CHANNELS: u32 = iow(0, size_of::<NumChannelsArg>());
pub const GET_DMA_CHANNELS: u32 = ior(1, size_of::<ChannelInfoArg>());
/// The argument is the signal number itself, not a pointer.
pub const SET_DMA_SIGNAL: u32 = io(2);
pub const DMA_READ: u32 = ior(3, size_of::<TransactionArg>());
pub const DMA_WRITE: u32 = ior(4, size_of::<TransactionArg>());
pub const DMA_READWRITE: u32 = ior(5, size_of::<InoutTransactionArg>());
pub const DMA_VIDEO_WRITE: u32 = ior(6, size_of::<VideoTransactionArg>());
pub const STOP_DMA_CHANNEL: u32 = ior(7, size_of::<ChannelArg>());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetNumChannels,
    GetChannels,
    SetSignal,
    Read,
    Write,
    ReadWrite,
    VideoWrite,
    Stop,
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::GetNumChannels => GET_NUM_DMA_CHANNELS,
            Command::GetChannels => GET_DMA_CHANNELS,
            Command::SetSignal => SET_DMA_SIGNAL,
            Command::Read => DMA_READ,
            Command::Write => DMA_WRITE,
            Command::ReadWrite => DMA_READWRITE,
            Command::VideoWrite => DMA_VIDEO_WRITE,
            Command::Stop => STOP_DMA_CHANNEL,
        }
    }

    /// Decodes a raw command, rejecting foreign or malformed numbers.
    pub fn decode(cmd: u32) -> Result<Command, Error> {
        if ioc_type(cmd) != IOCTL_MAGIC {
            error!("ioctl command magic number does not match");
            return Err(Error::NotTty);
        }
        if ioc_nr(cmd) >= NUM_IOCTLS {
            error!("ioctl command is out of range for this device");
            return Err(Error::NotTty);
        }
        let command = match cmd {
            GET_NUM_DMA_CHANNELS => Command::GetNumChannels,
            GET_DMA_CHANNELS => Command::GetChannels,
            SET_DMA_SIGNAL => Command::SetSignal,
            DMA_READ => Command::Read,
            DMA_WRITE => Command::Write,
            DMA_READWRITE => Command::ReadWrite,
            DMA_VIDEO_WRITE => Command::VideoWrite,
            STOP_DMA_CHANNEL => Command::Stop,
            _ => {
                error!("ioctl command {:#x} has a bad direction or size", cmd);
                return Err(Error::NotTty);
            }
        };
        Ok(command)
    }
}

/// `struct axidma_num_channels`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct NumChannelsArg {
    pub num_channels: i32,
    pub num_dma_tx_channels: i32,
    pub num_dma_rx_channels: i32,
    pub num_vdma_tx_channels: i32,
    pub num_vdma_rx_channels: i32,
}

impl From<NumChannels> for NumChannelsArg {
    fn from(num: NumChannels) -> Self {
        NumChannelsArg {
            num_channels: num.total as i32,
            num_dma_tx_channels: num.dma_tx as i32,
            num_dma_rx_channels: num.dma_rx as i32,
            num_vdma_tx_channels: num.vdma_tx as i32,
            num_vdma_rx_channels: num.vdma_rx as i32,
        }
    }
}

/// `struct axidma_chan`. The trailing kernel pointer is always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ChannelArg {
    pub dir: i32,
    pub ty: i32,
    pub channel_id: i32,
    #[cfg(target_pointer_width = "64")]
    _pad: [u8; 4],
    pub chan: usize,
}

impl ChannelArg {
    pub fn new(channel_id: i32, ty: ChannelType, dir: Direction) -> ChannelArg {
        let mut arg = ChannelArg::new_zeroed();
        arg.dir = dir as i32;
        arg.ty = ty as i32;
        arg.channel_id = channel_id;
        arg
    }
}

impl From<ChannelInfo> for ChannelArg {
    fn from(info: ChannelInfo) -> Self {
        ChannelArg::new(info.id, info.ty, info.dir)
    }
}

/// `struct axidma_channel_info`: where to write the channel array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ChannelInfoArg {
    pub channels: usize,
}

/// `struct axidma_transaction`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransactionArg {
    pub wait: u8,
    _pad: [u8; 3],
    pub channel_id: i32,
    pub buf: usize,
    pub buf_len: usize,
}

impl TransactionArg {
    pub fn new(channel_id: i32, buf: usize, buf_len: usize, wait: bool) -> TransactionArg {
        TransactionArg {
            wait: wait as u8,
            _pad: [0; 3],
            channel_id,
            buf,
            buf_len,
        }
    }
}

/// `struct axidma_inout_transaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InoutTransactionArg {
    pub wait: u8,
    _pad0: [u8; 3],
    pub tx_channel_id: i32,
    pub tx_buf: usize,
    pub tx_buf_len: usize,
    pub rx_channel_id: i32,
    #[cfg(target_pointer_width = "64")]
    _pad1: [u8; 4],
    pub rx_buf: usize,
    pub rx_buf_len: usize,
}

impl InoutTransactionArg {
    pub fn new(
        tx_channel_id: i32,
        tx: (usize, usize),
        rx_channel_id: i32,
        rx: (usize, usize),
        wait: bool,
    ) -> InoutTransactionArg {
        let mut arg = InoutTransactionArg::new_zeroed();
        arg.wait = wait as u8;
        arg.tx_channel_id = tx_channel_id;
        (arg.tx_buf, arg.tx_buf_len) = tx;
        arg.rx_channel_id = rx_channel_id;
        (arg.rx_buf, arg.rx_buf_len) = rx;
        arg
    }
}

/// `struct axidma_video_transaction`. `frame_buffers` points to an array of
/// `num_frame_buffers` buffer addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct VideoTransactionArg {
    pub channel_id: i32,
    pub num_frame_buffers: i32,
    pub frame_buffers: usize,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}
