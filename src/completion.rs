//! Starting transfers and waiting for them.
//!
//! A blocking transfer owns a single-shot completion: the engine callback
//! is the producer, the calling thread the consumer, and the wait is
//! bounded. A non-blocking transfer instead hands its completion to a
//! [`NotifySink`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, warn};

use crate::descriptor::TransferContext;
use crate::engine::{DmaChannel, DmaStatus};
use crate::registry::ChannelState;
use crate::Error;

/// Producer half of a completion. Cloned into the engine callback and into
/// the channel, so that `stop` can wake the waiter too.
#[derive(Debug, Clone)]
pub struct CompletionSignal(SyncSender<()>);

impl CompletionSignal {
    pub fn complete(&self) {
        // a full slot means the waiter is already woken
        let _ = self.0.try_send(());
    }
}

#[derive(Debug)]
pub struct CompletionWaiter(Receiver<()>);

impl CompletionWaiter {
    /// Returns `false` if nothing happened within `timeout`.
    ///
    /// A waiter whose signals were all dropped (the engine discarded the
    /// callback) wakes at once; the caller must check the engine status.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.0.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

pub fn completion() -> (CompletionSignal, CompletionWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (CompletionSignal(tx), CompletionWaiter(rx))
}

/// Completion of a non-blocking transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Process that requested the transfer.
    pub pid: i32,
    pub signal: i32,
    pub channel_id: i32,
}

/// Destination for asynchronous completions.
pub trait NotifySink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Delivers notifications into an mpsc queue owned by the embedding application.
#[derive(Debug)]
pub struct QueueSink {
    sender: Mutex<Sender<Notification>>,
}

impl QueueSink {
    pub fn new() -> (QueueSink, Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (
            QueueSink {
                sender: Mutex::new(tx),
            },
            rx,
        )
    }
}

impl NotifySink for QueueSink {
    fn notify(&self, notification: Notification) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(notification).is_err() {
            warn!("dropping notification for channel {}", notification.channel_id);
        }
    }
}

/// Queues the real-time signal to the owning process, with the channel id
/// as `si_int`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalSink;

/// A `sigval` whose `sival_int` member holds `value`.
///
/// `libc` only exposes the pointer member, and the int member overlays its
/// first bytes.
fn sigval_int(value: i32) -> libc::sigval {
    #[cfg(all(target_endian = "big", target_pointer_width = "64"))]
    let raw = (value as u32 as usize) << 32;
    #[cfg(not(all(target_endian = "big", target_pointer_width = "64")))]
    let raw = value as u32 as usize;
    libc::sigval {
        sival_ptr: raw as *mut libc::c_void,
    }
}

impl NotifySink for SignalSink {
    fn notify(&self, notification: Notification) {
        let value = sigval_int(notification.channel_id);
        let rc = unsafe { libc::sigqueue(notification.pid, notification.signal, value) };
        if rc < 0 {
            error!(
                "unable to send signal {} to process {}: {}",
                notification.signal,
                notification.pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Only the POSIX real-time signals may be used for notification.
pub fn valid_notify_signal(signal: i32) -> bool {
    signal >= libc::SIGRTMIN() && signal <= libc::SIGRTMAX()
}

/// Issues the prepared transfer and, for blocking transfers, waits for it.
///
/// On timeout or a non-successful engine status the channel is terminated
/// before returning.
pub fn start_and_wait<C: DmaChannel>(
    mut ctx: TransferContext<'_, C>,
    timeout: Duration,
) -> Result<(), Error> {
    let channel = ctx.channel();
    let info = channel.info();

    // submission only queues, nothing runs before this
    channel.hw().issue_pending();

    let waiter = match ctx.waiter() {
        Some(waiter) => waiter,
        None => {
            debug!("{} {} channel {}: started", info.ty, info.dir, info.id);
            ctx.finish(ChannelState::Submitted);
            return Ok(());
        }
    };

    let woken = waiter.wait_timeout(timeout);
    let status = channel.hw().tx_status(ctx.cookie());

    if !woken {
        error!("{} {} transaction timed out", info.ty, info.dir);
        ctx.fail(ChannelState::TimedOut);
        return Err(Error::Timeout);
    }
    if status != DmaStatus::Complete {
        error!(
            "{} {} transaction did not succeed, status is {:?}",
            info.ty, info.dir, status
        );
        ctx.fail(ChannelState::Failed);
        return Err(Error::EngineFailure);
    }

    channel.set_state(ChannelState::Completed);
    ctx.finish(ChannelState::Idle);
    Ok(())
}
