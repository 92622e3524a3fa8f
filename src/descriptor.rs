//! Turning a transfer request into a submitted engine descriptor.

use std::sync::Arc;

use log::{error, warn};

use crate::buffer::{self, BufferTable};
use crate::completion::{self, valid_notify_signal, CompletionWaiter, Notification, NotifySink};
use crate::engine::{
    ChannelType, Cookie, Direction, DmaChannel, DmaConfig, PrepFlags, SgEntry, SlaveConfig,
    VdmaConfig,
};
use crate::registry::{Channel, ChannelState};
use crate::{EngineError, Error};

/// Type-specific transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Dma {
        cyclic: bool,
    },
    Vdma {
        /// Pixels per line.
        width: usize,
        /// Lines per frame.
        height: usize,
        /// Bytes per pixel.
        depth: usize,
    },
}

impl TransferKind {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            TransferKind::Dma { .. } => ChannelType::Dma,
            TransferKind::Vdma { .. } => ChannelType::Vdma,
        }
    }

    /// Bytes per frame, for video transfers.
    pub fn frame_size(&self) -> Option<usize> {
        match *self {
            TransferKind::Dma { .. } => None,
            TransferKind::Vdma {
                width,
                height,
                depth,
            } => width.checked_mul(height)?.checked_mul(depth),
        }
    }

    pub fn slave_config(&self, dir: Direction) -> Result<SlaveConfig, Error> {
        match *self {
            TransferKind::Dma { cyclic } => Ok(SlaveConfig::Dma(DmaConfig {
                direction: dir.transfer_direction(),
                coalesce: 1,
                delay: 0,
                reset: false,
                cyclic,
            })),
            TransferKind::Vdma {
                width,
                height,
                depth,
            } => {
                if width == 0 || height == 0 || depth == 0 {
                    return Err(Error::InvalidArgument);
                }
                let line = width.checked_mul(depth).ok_or(Error::InvalidArgument)?;
                Ok(SlaveConfig::Vdma(VdmaConfig {
                    vsize: height,
                    hsize: line,
                    stride: line,
                    frame_delay: 0,
                    genlock: false,
                    master: 0,
                    frame_count_enable: false,
                    park: false,
                    park_frame: 0,
                    coalesce: 0,
                    delay: 0,
                    reset: false,
                    ext_fsync: false,
                }))
            }
        }
    }
}

/// A user buffer, by process virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    pub addr: usize,
    pub len: usize,
}

impl UserBuffer {
    pub fn new(addr: usize, len: usize) -> UserBuffer {
        UserBuffer { addr, len }
    }
}

/// One direction of data movement on one channel.
#[derive(Debug, Clone)]
pub struct TransferRequest<'b> {
    pub channel_id: i32,
    pub dir: Direction,
    pub kind: TransferKind,
    pub buffers: &'b [UserBuffer],
    pub wait: bool,
}

/// Who to tell when a non-blocking transfer completes.
#[derive(Clone)]
pub struct NotifyTarget {
    pub pid: i32,
    pub signal: i32,
    pub sink: Arc<dyn NotifySink>,
}

/// Terminates the channel on drop unless defused.
pub(crate) struct TerminateGuard<'a, C: DmaChannel> {
    channel: &'a Channel<C>,
    armed: bool,
}

impl<'a, C: DmaChannel> TerminateGuard<'a, C> {
    fn new(channel: &'a Channel<C>) -> TerminateGuard<'a, C> {
        TerminateGuard {
            channel,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<'a, C: DmaChannel> Drop for TerminateGuard<'a, C> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.channel.terminate() {
                warn!(
                    "terminating channel {} failed: {}",
                    self.channel.name(),
                    e
                );
            }
        }
    }
}

/// State of one submitted transfer, handed to [`completion::start_and_wait`].
///
/// Dropping the context without finishing it terminates the channel.
pub struct TransferContext<'a, C: DmaChannel> {
    channel: &'a Channel<C>,
    cookie: Cookie,
    waiter: Option<CompletionWaiter>,
    guard: TerminateGuard<'a, C>,
}

impl<'a, C: DmaChannel> TransferContext<'a, C> {
    pub fn channel(&self) -> &'a Channel<C> {
        self.channel
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn wait(&self) -> bool {
        self.waiter.is_some()
    }

    pub(crate) fn waiter(&mut self) -> Option<CompletionWaiter> {
        self.waiter.take()
    }

    /// Leaves the channel running in `state`.
    pub(crate) fn finish(self, state: ChannelState) {
        // a non-blocking transfer may already have completed
        if state != ChannelState::Submitted {
            self.channel.disarm();
            self.channel.set_state(state);
        }
        self.guard.defuse();
    }

    /// Records `state` and terminates the channel.
    pub(crate) fn fail(self, state: ChannelState) {
        self.channel.set_state(state);
        drop(self.guard);
    }
}

/// Builds, configures and submits the descriptor for `request`.
///
/// Buffer translation happens before the hardware is touched, so a bad
/// buffer leaves the channel alone. Once configuration starts, any failure
/// terminates the channel before returning.
pub fn prepare<'a, C: DmaChannel>(
    channel: &'a Channel<C>,
    buffers: &BufferTable,
    request: &TransferRequest<'_>,
    notify: NotifyTarget,
) -> Result<TransferContext<'a, C>, Error> {
    let info = channel.info();
    if request.buffers.is_empty() {
        return Err(Error::InvalidArgument);
    }

    let mut sg = buffer::list_with_capacity(request.buffers.len())?;
    for b in request.buffers {
        sg.push(SgEntry {
            bus_addr: buffers.translate(b.addr, b.len)?,
            len: b.len,
        });
    }
    let config = request.kind.slave_config(request.dir)?;

    channel.set_state(ChannelState::Configuring);
    let guard = TerminateGuard::new(channel);

    // some engine revisions do not implement channel configuration
    match channel.hw().slave_config(&config) {
        Ok(()) | Err(EngineError::NotSupported) => {}
        Err(e) => {
            error!(
                "device control for the {} {} channel failed: {}",
                info.ty, info.dir, e
            );
            return Err(Error::Engine(e));
        }
    }

    let flags = PrepFlags::INTERRUPT | PrepFlags::ACK;
    let mut tx = channel
        .hw()
        .prep_slave_sg(&sg, request.dir.transfer_direction(), flags)
        .ok_or_else(|| {
            error!(
                "unable to prepare the dma engine for the {} {} buffer",
                info.ty, info.dir
            );
            Error::EngineBusy
        })?;
    drop(sg);

    let waiter = if request.wait {
        let (signal, waiter) = completion::completion();
        channel.arm(signal.clone());
        tx.set_callback(Box::new(move || signal.complete()));
        Some(waiter)
    } else {
        let state = channel.state_handle();
        let channel_id = request.channel_id;
        tx.set_callback(Box::new(move || {
            if valid_notify_signal(notify.signal) {
                notify.sink.notify(Notification {
                    pid: notify.pid,
                    signal: notify.signal,
                    channel_id,
                });
            }
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ChannelState::Submitted {
                *state = ChannelState::Idle;
            }
        }));
        None
    };

    let cookie = channel.hw().submit(tx).map_err(|e| {
        error!(
            "unable to submit the {} {} transaction to the engine: {}",
            info.ty, info.dir, e
        );
        Error::EngineBusy
    })?;
    channel.set_state(ChannelState::Submitted);

    Ok(TransferContext {
        channel,
        cookie,
        waiter,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CoherentRegion;
    use crate::completion::QueueSink;
    use crate::engine::{ChannelDescriptor, TransferDirection};
    use crate::registry::ChannelRegistry;
    use crate::sim::{ConfigResponse, SimEngine};
    use crate::Config;

    fn setup() -> (SimEngine, ChannelRegistry<SimEngine>, BufferTable) {
        let engine = SimEngine::new(vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx"),
            ChannelDescriptor::new(1, ChannelType::Vdma, Direction::Write, "vtx"),
        ]);
        let registry = ChannelRegistry::initialize(engine.clone(), &Config::default()).unwrap();
        let table = BufferTable::new();
        table
            .insert(CoherentRegion {
                user_addr: 0x10000,
                kern_addr: 0x10000,
                bus_addr: 0x4000_0000,
                size: 0x10000,
            })
            .unwrap();
        (engine, registry, table)
    }

    fn target() -> NotifyTarget {
        let (sink, _rx) = QueueSink::new();
        NotifyTarget {
            pid: 1,
            signal: -1,
            sink: Arc::new(sink),
        }
    }

    #[test]
    fn dma_prepare_configures_and_submits() {
        let (engine, registry, table) = setup();
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [UserBuffer::new(0x10100, 0x100)];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &bufs,
            wait: true,
        };
        let ctx = prepare(chan, &table, &request, target()).unwrap();
        assert!(ctx.wait());
        assert_eq!(chan.state(), ChannelState::Submitted);

        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        let configs = sim.configs();
        assert_eq!(configs.len(), 1);
        match configs[0] {
            SlaveConfig::Dma(c) => {
                assert_eq!(c.coalesce, 1);
                assert_eq!(c.direction, TransferDirection::MemToDev);
                assert!(!c.reset);
            }
            _ => panic!("expected a DMA config"),
        }
        let sg = sim.last_sg().unwrap();
        assert_eq!(
            sg,
            vec![SgEntry {
                bus_addr: 0x4000_0100,
                len: 0x100
            }]
        );
        assert_eq!(sim.last_flags(), Some(PrepFlags::INTERRUPT | PrepFlags::ACK));
    }

    #[test]
    fn cyclic_dma_reaches_the_channel_config() {
        let (engine, registry, table) = setup();
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [UserBuffer::new(0x10000, 0x800)];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: true },
            buffers: &bufs,
            wait: false,
        };
        let ctx = prepare(chan, &table, &request, target()).unwrap();
        assert!(!ctx.wait());

        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        match sim.configs().as_slice() {
            [SlaveConfig::Dma(c)] => {
                assert!(c.cyclic);
                assert_eq!(c.coalesce, 1);
                assert_eq!(c.delay, 0);
            }
            other => panic!("unexpected configs {:?}", other),
        }
    }

    #[test]
    fn vdma_config_uses_frame_geometry() {
        let kind = TransferKind::Vdma {
            width: 640,
            height: 480,
            depth: 4,
        };
        assert_eq!(kind.frame_size(), Some(640 * 480 * 4));
        match kind.slave_config(Direction::Write).unwrap() {
            SlaveConfig::Vdma(c) => {
                assert_eq!(c.vsize, 480);
                assert_eq!(c.hsize, 2560);
                assert_eq!(c.stride, 2560);
                assert!(!c.genlock);
                assert!(!c.park);
            }
            _ => panic!("expected a VDMA config"),
        }
        let bad = TransferKind::Vdma {
            width: 0,
            height: 480,
            depth: 4,
        };
        assert!(matches!(
            bad.slave_config(Direction::Write),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn bad_buffer_fails_before_touching_hardware() {
        let (engine, registry, table) = setup();
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [
            UserBuffer::new(0x10000, 0x100),
            UserBuffer::new(0x1ff00, 0x200),
        ];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &bufs,
            wait: false,
        };
        assert!(matches!(
            prepare(chan, &table, &request, target()),
            Err(Error::Fault)
        ));
        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        assert!(sim.configs().is_empty());
        assert_eq!(sim.terminations(), 0);
        assert_eq!(chan.state(), ChannelState::Idle);
    }

    #[test]
    fn unsupported_config_is_tolerated() {
        let (engine, registry, table) = setup();
        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        sim.set_config_response(ConfigResponse::NotSupported);
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [UserBuffer::new(0x10000, 0x100)];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &bufs,
            wait: false,
        };
        assert!(prepare(chan, &table, &request, target()).is_ok());
        assert_eq!(sim.submitted(), 1);
    }

    #[test]
    fn engine_failures_terminate_the_channel() {
        let (engine, registry, table) = setup();
        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [UserBuffer::new(0x10000, 0x100)];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &bufs,
            wait: true,
        };

        sim.set_config_response(ConfigResponse::Reject(libc::EIO));
        assert!(matches!(
            prepare(chan, &table, &request, target()),
            Err(Error::Engine(EngineError::Rejected(_)))
        ));
        assert_eq!(sim.terminations(), 1);

        sim.set_config_response(ConfigResponse::Accept);
        sim.set_prep_fails(true);
        assert!(matches!(
            prepare(chan, &table, &request, target()),
            Err(Error::EngineBusy)
        ));
        assert_eq!(sim.terminations(), 2);

        sim.set_prep_fails(false);
        sim.set_submit_fails(true);
        assert!(matches!(
            prepare(chan, &table, &request, target()),
            Err(Error::EngineBusy)
        ));
        assert_eq!(sim.terminations(), 3);
        assert_eq!(chan.state(), ChannelState::Idle);
    }

    #[test]
    fn dropping_an_unstarted_context_terminates() {
        let (engine, registry, table) = setup();
        let chan = registry.lookup(0, ChannelType::Dma, Direction::Write).unwrap();
        let bufs = [UserBuffer::new(0x10000, 0x100)];
        let request = TransferRequest {
            channel_id: 0,
            dir: Direction::Write,
            kind: TransferKind::Dma { cyclic: false },
            buffers: &bufs,
            wait: false,
        };
        let ctx = prepare(chan, &table, &request, target()).unwrap();
        drop(ctx);
        let sim = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        assert_eq!(sim.terminations(), 1);
        assert_eq!(chan.state(), ChannelState::Idle);
    }
}
