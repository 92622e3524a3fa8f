//! Boundary to the platform DMA engine driver.
//!
//! The orchestration layer never touches registers. It talks to the engine
//! through the traits below, which follow the shape of the Linux dmaengine
//! slave API: configure a channel, prepare a scatter-gather descriptor,
//! submit it for a cookie, issue pending work, query the cookie and
//! terminate everything on the channel.

use std::fmt;

use bitflags::bitflags;

use crate::EngineError;

/// Direction from the perspective of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Direction {
    /// Host memory to fabric.
    Write = 0,
    /// Fabric to host memory.
    Read = 1,
}

impl Direction {
    pub fn from_raw(raw: i32) -> Option<Direction> {
        match raw {
            0 => Some(Direction::Write),
            1 => Some(Direction::Read),
            _ => None,
        }
    }

    pub fn transfer_direction(self) -> TransferDirection {
        match self {
            Direction::Write => TransferDirection::MemToDev,
            Direction::Read => TransferDirection::DevToMem,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Write => write!(f, "transmit"),
            Direction::Read => write!(f, "receive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ChannelType {
    Dma = 0,
    Vdma = 1,
}

impl ChannelType {
    pub fn from_raw(raw: i32) -> Option<ChannelType> {
        match raw {
            0 => Some(ChannelType::Dma),
            1 => Some(ChannelType::Vdma),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Dma => write!(f, "DMA"),
            ChannelType::Vdma => write!(f, "VDMA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    MemToDev,
    DevToMem,
}

/// A channel as described by the platform (device tree or equivalent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: i32,
    pub ty: ChannelType,
    pub dir: Direction,
    /// Platform name of the channel, e.g. `tx_channel`.
    pub name: String,
}

impl ChannelDescriptor {
    pub fn new(id: i32, ty: ChannelType, dir: Direction, name: &str) -> ChannelDescriptor {
        ChannelDescriptor {
            id,
            ty,
            dir,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub bus_addr: u64,
    pub len: usize,
}

/// Settings for an AXI DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    pub direction: TransferDirection,
    /// Completions per interrupt.
    pub coalesce: u32,
    /// Delay counter interrupt, 0 disables it.
    pub delay: u32,
    pub reset: bool,
    /// Re-run the descriptor chain until terminated.
    pub cyclic: bool,
}

/// Settings for an AXI VDMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdmaConfig {
    /// Lines per frame.
    pub vsize: usize,
    /// Bytes per line.
    pub hsize: usize,
    pub stride: usize,
    pub frame_delay: u32,
    pub genlock: bool,
    pub master: u32,
    pub frame_count_enable: bool,
    pub park: bool,
    pub park_frame: u32,
    pub coalesce: u32,
    pub delay: u32,
    pub reset: bool,
    pub ext_fsync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveConfig {
    Dma(DmaConfig),
    Vdma(VdmaConfig),
}

bitflags! {
    /// Flags passed when preparing a descriptor.
    pub struct PrepFlags: u32 {
        /// Raise an interrupt when the descriptor completes.
        const INTERRUPT = 1 << 0;
        /// The client acknowledges the descriptor, the engine may recycle it.
        const ACK = 1 << 1;
    }
}

/// Handle returned by the engine on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Complete,
    InProgress,
    Paused,
    Error,
}

/// Completion callback. Runs exactly once, in the engine's interrupt path.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A prepared but not yet submitted transaction.
///
/// The engine keeps its own copy of the scatter-gather list, the caller's
/// list can be dropped as soon as the descriptor is prepared.
pub struct TxDescriptor {
    pub sg: Vec<SgEntry>,
    pub direction: TransferDirection,
    pub flags: PrepFlags,
    pub callback: Option<Callback>,
}

impl TxDescriptor {
    pub fn new(sg: &[SgEntry], direction: TransferDirection, flags: PrepFlags) -> TxDescriptor {
        TxDescriptor {
            sg: sg.to_vec(),
            direction,
            flags,
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }
}

impl fmt::Debug for TxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxDescriptor")
            .field("sg", &self.sg)
            .field("direction", &self.direction)
            .field("flags", &self.flags)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// One reserved hardware channel.
pub trait DmaChannel: Send + Sync {
    fn slave_config(&self, config: &SlaveConfig) -> Result<(), EngineError>;

    /// Returns `None` when the engine cannot take another descriptor.
    fn prep_slave_sg(
        &self,
        sg: &[SgEntry],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Option<TxDescriptor>;

    fn submit(&self, tx: TxDescriptor) -> Result<Cookie, EngineError>;

    /// Submission only queues work, this starts it.
    fn issue_pending(&self);

    fn tx_status(&self, cookie: Cookie) -> DmaStatus;

    /// Aborts every queued and running transaction. Aborted cookies never
    /// report [`DmaStatus::Complete`] and their callbacks never run.
    fn terminate_all(&self) -> Result<(), EngineError>;
}

/// The platform DMA engine: enumerates and hands out channels.
pub trait DmaEngine: Send + Sync + 'static {
    type Channel: DmaChannel + 'static;

    /// Every channel the platform description exposes.
    fn enumerate(&self) -> Vec<ChannelDescriptor>;

    /// Reserves a channel exclusively.
    fn request_channel(&self, desc: &ChannelDescriptor) -> Result<Self::Channel, EngineError>;

    fn release_channel(&self, chan: Self::Channel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_enum_values_match_wire_protocol() {
        assert_eq!(Direction::Write as i32, 0);
        assert_eq!(Direction::Read as i32, 1);
        assert_eq!(ChannelType::Dma as i32, 0);
        assert_eq!(ChannelType::Vdma as i32, 1);
        assert_eq!(Direction::from_raw(2), None);
        assert_eq!(ChannelType::from_raw(-1), None);
    }

    #[test]
    fn direction_maps_to_engine_direction() {
        assert_eq!(
            Direction::Write.transfer_direction(),
            TransferDirection::MemToDev
        );
        assert_eq!(
            Direction::Read.transfer_direction(),
            TransferDirection::DevToMem
        );
        assert_eq!(Direction::Write.to_string(), "transmit");
        assert_eq!(ChannelType::Vdma.to_string(), "VDMA");
    }
}
