//! Transfer orchestration for Xilinx AXI DMA and VDMA engines, and the
//! userspace library that drives it.
//!
//! The driver side ([`AxiDmaDevice`]) sits on top of a platform DMA engine
//! ([`engine::DmaEngine`]) and is reached through the ioctl protocol of a
//! [`ControlDevice`]. The client side ([`AxiDma`]) speaks that protocol,
//! either to the kernel's `/dev/axidma` node or to an in-process control
//! device backed by the [`sim`] engine.

mod error;
pub use error::{EngineError, Error};

mod config;
pub use config::{Config, CHRDEV_NAME, DEFAULT_TIMEOUT, MAX_CHANNEL_ID};

pub mod engine;
pub mod sim;

pub mod buffer;
pub mod completion;
pub mod descriptor;
pub mod registry;

mod device;
pub use device::AxiDmaDevice;

pub mod control;
pub mod ioctl;
pub use control::{ControlDevice, Credentials, Session};

pub mod client;
pub use client::{AxiDma, DmaBuffer};

#[cfg(feature = "async")]
pub use client::NotificationListener;

pub use engine::{ChannelType, Direction};
