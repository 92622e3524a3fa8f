//! The control device: access checks, exclusive ownership and ioctl dispatch.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::buffer::{self, CoherentRegion};
use crate::descriptor::UserBuffer;
use crate::device::AxiDmaDevice;
use crate::engine::{ChannelType, Direction, DmaEngine};
use crate::ioctl::{
    ChannelArg, ChannelInfoArg, Command, InoutTransactionArg, NumChannelsArg, TransactionArg,
    VideoTransactionArg,
};
use crate::Error;

/// Access to the memory of the process issuing an ioctl.
pub trait UserAccess {
    fn copy_from_user(&self, dst: &mut [u8], src: usize) -> Result<(), Error>;
    fn copy_to_user(&self, dst: usize, src: &[u8]) -> Result<(), Error>;
}

/// The caller's own address space, for an in-process control device.
#[derive(Debug)]
pub struct LocalMemory {
    _private: (),
}

impl LocalMemory {
    /// # Safety
    ///
    /// Every non-null address passed through this accessor must be valid
    /// for the requested number of bytes.
    pub unsafe fn new() -> LocalMemory {
        LocalMemory { _private: () }
    }
}

impl UserAccess for LocalMemory {
    fn copy_from_user(&self, dst: &mut [u8], src: usize) -> Result<(), Error> {
        if src == 0 {
            return Err(Error::Fault);
        }
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn copy_to_user(&self, dst: usize, src: &[u8]) -> Result<(), Error> {
        if dst == 0 {
            return Err(Error::Fault);
        }
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
        Ok(())
    }
}

fn read_arg<T>(mem: &dyn UserAccess, arg: usize, what: &str) -> Result<T, Error>
where
    T: FromBytes + IntoBytes + Immutable,
{
    let mut value = T::new_zeroed();
    mem.copy_from_user(value.as_mut_bytes(), arg).map_err(|e| {
        error!("unable to copy {} from userspace", what);
        e
    })?;
    Ok(value)
}

/// Who is opening the device, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Holds the administrative capability.
    pub admin: bool,
    /// Opened with `O_EXCL`.
    pub exclusive: bool,
    pub pid: i32,
}

impl Credentials {
    /// The calling process, asking for exclusive access.
    pub fn current() -> Credentials {
        Credentials {
            admin: unsafe { libc::geteuid() } == 0,
            exclusive: true,
            pid: std::process::id() as i32,
        }
    }
}

/// Owns the single driver instance and hands out at most one session.
pub struct ControlDevice<E: DmaEngine> {
    device: AxiDmaDevice<E>,
    open: AtomicBool,
}

impl<E: DmaEngine> fmt::Debug for ControlDevice<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ControlDevice")?;
        writeln!(f, "  open: {}", self.open.load(Ordering::Relaxed))?;
        write!(f, "  {:?}", &self.device)
    }
}

impl<E: DmaEngine> ControlDevice<E> {
    pub fn new(device: AxiDmaDevice<E>) -> Arc<ControlDevice<E>> {
        Arc::new(ControlDevice {
            device,
            open: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &AxiDmaDevice<E> {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn open(self: &Arc<Self>, creds: Credentials) -> Result<Session<E>, Error> {
        if !creds.admin {
            error!("only privileged processes may open the DMA device");
            return Err(Error::PermissionDenied);
        }
        if !creds.exclusive {
            error!("the DMA device must be opened exclusively");
            return Err(Error::InvalidArgument);
        }
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("the DMA device is already open");
            return Err(Error::Busy);
        }
        self.device.set_owner(creds.pid);
        debug!("device opened by process {}", creds.pid);
        Ok(Session { dev: self.clone() })
    }
}

/// An open handle on the control device. Closing it releases ownership.
pub struct Session<E: DmaEngine> {
    dev: Arc<ControlDevice<E>>,
}

impl<E: DmaEngine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session (owner {})", self.dev.device.owner())
    }
}

impl<E: DmaEngine> Session<E> {
    pub fn device(&self) -> &AxiDmaDevice<E> {
        &self.dev.device
    }

    pub fn mmap(&self, size: usize) -> Result<CoherentRegion, Error> {
        self.device().mmap(size)
    }

    pub fn munmap(&self, user_addr: usize) -> Result<(), Error> {
        self.device().munmap(user_addr)
    }

    /// Runs one ioctl. `arg` is an address in the caller's memory, except
    /// for [`Command::SetSignal`] where it is the signal number.
    pub fn ioctl(&self, cmd: u32, arg: usize, mem: &dyn UserAccess) -> Result<(), Error> {
        let command = Command::decode(cmd)?;
        let dev = self.device();
        debug!("ioctl {:?}", command);

        match command {
            Command::GetNumChannels => {
                let num = NumChannelsArg::from(dev.num_channels());
                mem.copy_to_user(arg, num.as_bytes()).map_err(|e| {
                    error!("unable to copy channel info to userspace");
                    e
                })
            }
            Command::GetChannels => {
                let req: ChannelInfoArg = read_arg(mem, arg, "channel buffer address")?;
                let channels: Vec<ChannelArg> =
                    dev.channels().into_iter().map(ChannelArg::from).collect();
                mem.copy_to_user(req.channels, channels.as_slice().as_bytes())
                    .map_err(|e| {
                        error!("unable to copy channel ids to userspace");
                        e
                    })
            }
            Command::SetSignal => {
                let signal = i32::try_from(arg).map_err(|_| Error::InvalidArgument)?;
                dev.set_signal(signal)
            }
            Command::Read | Command::Write => {
                let trans: TransactionArg = read_arg(mem, arg, "transfer info")?;
                if command == Command::Read {
                    dev.read(trans.channel_id, trans.buf, trans.buf_len, trans.wait != 0)
                } else {
                    dev.write(trans.channel_id, trans.buf, trans.buf_len, trans.wait != 0)
                }
            }
            Command::ReadWrite => {
                let trans: InoutTransactionArg = read_arg(mem, arg, "transfer info")?;
                dev.read_write(
                    trans.tx_channel_id,
                    UserBuffer::new(trans.tx_buf, trans.tx_buf_len),
                    trans.rx_channel_id,
                    UserBuffer::new(trans.rx_buf, trans.rx_buf_len),
                    trans.wait != 0,
                )
            }
            Command::VideoWrite => {
                let trans: VideoTransactionArg = read_arg(mem, arg, "video transfer info")?;
                let count = usize::try_from(trans.num_frame_buffers)
                    .ok()
                    .filter(|&n| n > 0)
                    .ok_or(Error::InvalidArgument)?;
                let mut frames = buffer::list_with_capacity::<usize>(count)?;
                frames.resize(count, 0);
                mem.copy_from_user(frames.as_mut_slice().as_mut_bytes(), trans.frame_buffers)
                    .map_err(|e| {
                        error!("unable to copy frame buffer addresses from userspace");
                        e
                    })?;
                dev.video_write(
                    trans.channel_id,
                    &frames,
                    trans.width,
                    trans.height,
                    trans.depth,
                )
            }
            Command::Stop => {
                let chan: ChannelArg = read_arg(mem, arg, "channel info")?;
                let ty = ChannelType::from_raw(chan.ty).ok_or(Error::NoSuchDevice)?;
                let dir = Direction::from_raw(chan.dir).ok_or(Error::NoSuchDevice)?;
                dev.stop(chan.channel_id, ty, dir)
            }
        }
    }
}

impl<E: DmaEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.dev.open.store(false, Ordering::Release);
        debug!("device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::QueueSink;
    use crate::engine::ChannelDescriptor;
    use crate::ioctl::{self, GET_NUM_DMA_CHANNELS, SET_DMA_SIGNAL, STOP_DMA_CHANNEL};
    use crate::sim::{HeapAllocator, SimEngine};
    use crate::Config;

    fn control() -> Arc<ControlDevice<SimEngine>> {
        let engine = SimEngine::new(vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx"),
        ]);
        let (sink, _rx) = QueueSink::new();
        let device =
            AxiDmaDevice::new(engine, HeapAllocator::new(), Arc::new(sink), Config::default())
                .unwrap();
        ControlDevice::new(device)
    }

    fn admin() -> Credentials {
        Credentials {
            admin: true,
            exclusive: true,
            pid: 77,
        }
    }

    #[test]
    fn open_requires_privilege_and_exclusivity() {
        let ctl = control();
        let mut creds = admin();
        creds.admin = false;
        assert!(matches!(ctl.open(creds), Err(Error::PermissionDenied)));
        creds.admin = true;
        creds.exclusive = false;
        assert!(matches!(ctl.open(creds), Err(Error::InvalidArgument)));

        let session = ctl.open(admin()).unwrap();
        assert_eq!(ctl.device().owner(), 77);
        assert!(matches!(ctl.open(admin()), Err(Error::Busy)));
        drop(session);
        assert!(!ctl.is_open());
        assert!(ctl.open(admin()).is_ok());
    }

    #[test]
    fn current_credentials_describe_this_process() {
        let creds = Credentials::current();
        assert_eq!(creds.pid, std::process::id() as i32);
        assert!(creds.exclusive);
        assert_eq!(creds.admin, unsafe { libc::geteuid() } == 0);
    }

    #[test]
    fn get_num_channels_copies_counts() {
        let ctl = control();
        let session = ctl.open(admin()).unwrap();
        let mem = unsafe { LocalMemory::new() };
        let mut num = NumChannelsArg::default();
        session
            .ioctl(GET_NUM_DMA_CHANNELS, &mut num as *mut _ as usize, &mem)
            .unwrap();
        assert_eq!(num.num_channels, 2);
        assert_eq!(num.num_dma_tx_channels, 1);
        assert_eq!(num.num_dma_rx_channels, 1);
        assert_eq!(num.num_vdma_tx_channels, 0);
    }

    #[test]
    fn null_argument_is_a_fault() {
        let ctl = control();
        let session = ctl.open(admin()).unwrap();
        let mem = unsafe { LocalMemory::new() };
        assert!(matches!(
            session.ioctl(GET_NUM_DMA_CHANNELS, 0, &mem),
            Err(Error::Fault)
        ));
    }

    #[test]
    fn set_signal_passes_the_value() {
        let ctl = control();
        let session = ctl.open(admin()).unwrap();
        let mem = unsafe { LocalMemory::new() };
        let signal = libc::SIGRTMIN() as usize;
        session.ioctl(SET_DMA_SIGNAL, signal, &mem).unwrap();
        assert_eq!(session.device().notify_signal(), Some(signal as i32));
        assert!(matches!(
            session.ioctl(SET_DMA_SIGNAL, libc::SIGTERM as usize, &mem),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn stop_with_unknown_type_is_no_such_device() {
        let ctl = control();
        let session = ctl.open(admin()).unwrap();
        let mem = unsafe { LocalMemory::new() };
        let mut chan = ChannelArg::new(0, ChannelType::Dma, Direction::Write);
        session
            .ioctl(STOP_DMA_CHANNEL, &chan as *const _ as usize, &mem)
            .unwrap();
        chan.ty = 7;
        assert!(matches!(
            session.ioctl(STOP_DMA_CHANNEL, &chan as *const _ as usize, &mem),
            Err(Error::NoSuchDevice)
        ));
    }

    #[test]
    fn unknown_command_is_not_tty() {
        let ctl = control();
        let session = ctl.open(admin()).unwrap();
        let mem = unsafe { LocalMemory::new() };
        let cmd = ioctl::ioc(ioctl::IOC_READ, b'Q', 1, 8);
        assert!(matches!(session.ioctl(cmd, 0, &mem), Err(Error::NotTty)));
    }
}
