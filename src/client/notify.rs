use std::fs::File;
use std::io::prelude::*;
use std::mem;
use std::os::unix::io::FromRawFd;
use std::ptr;

use async_io::Async;
use log::warn;

use crate::completion::valid_notify_signal;
use crate::Error;

const SIGINFO_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();

/// Receives the completion signals of non-blocking transfers as a stream of
/// channel ids.
///
/// The signal is blocked for the calling thread and read from a `signalfd`,
/// so create the listener before spawning other threads.
#[derive(Debug)]
pub struct NotificationListener {
    fd: Async<File>,
    signal: i32,
}

impl NotificationListener {
    pub fn new(signal: i32) -> Result<NotificationListener, Error> {
        if !valid_notify_signal(signal) {
            return Err(Error::InvalidArgument);
        }

        let file;
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signal);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            file = File::from_raw_fd(fd);
        }

        Ok(NotificationListener {
            fd: Async::new(file)?,
            signal,
        })
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    /// Waits for the next completion and returns its channel id.
    pub async fn next(&mut self) -> Result<i32, Error> {
        loop {
            let mut buf = [0u8; SIGINFO_SIZE];
            let n = unsafe { self.fd.read_with_mut(|s| s.read(&mut buf)).await? };
            if n != SIGINFO_SIZE {
                warn!("short read of {} bytes from signalfd", n);
                continue;
            }
            let info: libc::signalfd_siginfo =
                unsafe { ptr::read_unaligned(buf.as_ptr() as *const libc::signalfd_siginfo) };
            if info.ssi_signo as i32 != self.signal {
                continue;
            }
            return Ok(info.ssi_int);
        }
    }
}
