//! Catalog of the hardware channels owned by the driver.
//!
//! Channels are enumerated and reserved once, at initialization, and
//! released when the registry is dropped. The table itself is never
//! mutated afterwards, so lookups take no lock.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::completion::CompletionSignal;
use crate::engine::{ChannelDescriptor, ChannelType, Direction, DmaChannel, DmaEngine};
use crate::{Config, EngineError, Error};

/// Where a channel is in the life of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Configuring,
    Submitted,
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelInfo {
    pub id: i32,
    pub ty: ChannelType,
    pub dir: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumChannels {
    pub total: usize,
    pub dma_tx: usize,
    pub dma_rx: usize,
    pub vdma_tx: usize,
    pub vdma_rx: usize,
}

impl NumChannels {
    fn count(&mut self, info: &ChannelInfo) {
        self.total += 1;
        match (info.ty, info.dir) {
            (ChannelType::Dma, Direction::Write) => self.dma_tx += 1,
            (ChannelType::Dma, Direction::Read) => self.dma_rx += 1,
            (ChannelType::Vdma, Direction::Write) => self.vdma_tx += 1,
            (ChannelType::Vdma, Direction::Read) => self.vdma_rx += 1,
        }
    }
}

/// A reserved channel plus the bookkeeping the orchestrator needs for it.
pub struct Channel<C> {
    info: ChannelInfo,
    name: String,
    chan: C,
    state: Arc<Mutex<ChannelState>>,
    // completion of the transfer currently blocked on this channel
    armed: Mutex<Option<CompletionSignal>>,
    busy: Mutex<()>,
}

impl<C> fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Channel ({})", &self.name)?;
        writeln!(f, "  id: {}", self.info.id)?;
        writeln!(f, "  type: {}", self.info.ty)?;
        write!(f, "  direction: {}", self.info.dir)
    }
}

impl<C: DmaChannel> Channel<C> {
    fn new(desc: &ChannelDescriptor, chan: C) -> Channel<C> {
        Channel {
            info: ChannelInfo {
                id: desc.id,
                ty: desc.ty,
                dir: desc.dir,
            },
            name: desc.name.clone(),
            chan,
            state: Arc::new(Mutex::new(ChannelState::Idle)),
            armed: Mutex::new(None),
            busy: Mutex::new(()),
        }
    }

    pub fn info(&self) -> ChannelInfo {
        self.info
    }

    pub fn id(&self) -> i32 {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying engine channel.
    pub fn hw(&self) -> &C {
        &self.chan
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(
                "{} {} channel {}: {:?} -> {:?}",
                self.info.ty, self.info.dir, self.info.id, *current, state
            );
            *current = state;
        }
    }

    pub(crate) fn state_handle(&self) -> Arc<Mutex<ChannelState>> {
        self.state.clone()
    }

    /// Serializes transfers on this channel.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn arm(&self, signal: CompletionSignal) {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(signal);
    }

    pub(crate) fn disarm(&self) {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Aborts all work on the channel and wakes a blocked waiter, if any.
    ///
    /// Does not take the transfer lock, so it can race a waiter.
    pub fn terminate(&self) -> Result<(), EngineError> {
        let rc = self.chan.terminate_all();
        if let Some(signal) = self.armed.lock().unwrap_or_else(|e| e.into_inner()).take() {
            signal.complete();
        }
        self.set_state(ChannelState::Idle);
        rc
    }
}

/// Channels reserved so far during initialization, released on early exit.
struct Reservation<'a, E: DmaEngine> {
    engine: &'a E,
    channels: Vec<Channel<E::Channel>>,
}

impl<'a, E: DmaEngine> Reservation<'a, E> {
    fn commit(mut self) -> Vec<Channel<E::Channel>> {
        std::mem::take(&mut self.channels)
    }
}

impl<'a, E: DmaEngine> Drop for Reservation<'a, E> {
    fn drop(&mut self) {
        for channel in self.channels.drain(..) {
            warn!("releasing channel {} after failed initialization", channel.name);
            self.engine.release_channel(channel.chan);
        }
    }
}

pub struct ChannelRegistry<E: DmaEngine> {
    engine: E,
    channels: Vec<Channel<E::Channel>>,
    num: NumChannels,
}

impl<E: DmaEngine> fmt::Debug for ChannelRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("num", &self.num)
            .field("channels", &self.channels)
            .finish()
    }
}

impl<E: DmaEngine> ChannelRegistry<E> {
    /// Enumerates the platform channels and reserves each one exclusively.
    ///
    /// Descriptors with an id above the configured maximum, or repeating an
    /// (id, type, direction) triple, are skipped. Fails with
    /// [`Error::NoChannelsFound`] when nothing usable is left.
    pub fn initialize(engine: E, config: &Config) -> Result<ChannelRegistry<E>, Error> {
        let mut num = NumChannels::default();
        let mut seen: Vec<ChannelInfo> = Vec::new();
        let mut reservation = Reservation {
            engine: &engine,
            channels: Vec::new(),
        };

        for desc in engine.enumerate() {
            if desc.id < 0 || desc.id > config.max_channel_id {
                warn!(
                    "ignoring {} {} channel {} ({}): id out of range",
                    desc.ty, desc.dir, desc.id, desc.name
                );
                continue;
            }
            let info = ChannelInfo {
                id: desc.id,
                ty: desc.ty,
                dir: desc.dir,
            };
            if seen.contains(&info) {
                warn!(
                    "ignoring duplicate {} {} channel {} ({})",
                    desc.ty, desc.dir, desc.id, desc.name
                );
                continue;
            }

            let chan = engine.request_channel(&desc).map_err(|e| {
                warn!("unable to get slave channel {}: {}", desc.name, e);
                match e {
                    EngineError::Busy => Error::EngineBusy,
                    e => Error::Engine(e),
                }
            })?;
            reservation.channels.push(Channel::new(&desc, chan));
            seen.push(info);
            num.count(&info);
        }

        if num.total == 0 {
            return Err(Error::NoChannelsFound);
        }

        let channels = reservation.commit();
        info!(
            "DMA: found {} transmit and {} receive channels",
            num.dma_tx, num.dma_rx
        );
        info!(
            "VDMA: found {} transmit and {} receive channels",
            num.vdma_tx, num.vdma_rx
        );

        Ok(ChannelRegistry {
            engine,
            channels,
            num,
        })
    }

    pub fn lookup(
        &self,
        id: i32,
        ty: ChannelType,
        dir: Direction,
    ) -> Result<&Channel<E::Channel>, Error> {
        self.channels
            .iter()
            .find(|c| c.info.id == id && c.info.ty == ty && c.info.dir == dir)
            .ok_or_else(|| {
                warn!("invalid channel id {} for {} {} channel", id, ty, dir);
                Error::NoSuchDevice
            })
    }

    pub fn num_channels(&self) -> NumChannels {
        self.num
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelInfo> + '_ {
        self.channels.iter().map(|c| c.info)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Terminates outstanding work on every channel, keeping the reservations.
    pub fn terminate_all(&self) {
        for channel in &self.channels {
            if let Err(e) = channel.terminate() {
                warn!("terminating channel {} failed: {}", channel.name, e);
            }
        }
    }

    /// Terminates outstanding work and releases every channel.
    pub fn teardown(self) {
        drop(self);
    }
}

impl<E: DmaEngine> Drop for ChannelRegistry<E> {
    fn drop(&mut self) {
        for channel in self.channels.drain(..) {
            if let Err(e) = channel.terminate() {
                warn!("terminating channel {} failed: {}", channel.name, e);
            }
            self.engine.release_channel(channel.chan);
        }
    }
}
