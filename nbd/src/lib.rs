//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides the oldstyle NBD wire format, a small client for
//! driving servers, and the ioctl sequence that hands a socket to the Linux
//! kernel's NBD module.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `device` - Enable Linux kernel NBD device support (requires root)

mod client;
mod protocol;

#[cfg(feature = "device")]
mod device;

pub use client::{NbdClient, read_greeting};
pub use protocol::*;

#[cfg(feature = "device")]
pub use device::{DeviceControl, DeviceError, DeviceOp, NbdDevice, Teardown};
