#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

extern crate alloc;

#[macro_use]
extern crate num_derive;

mod cell;
mod config;
mod crc;
pub mod encodings;
mod error;
mod frame;
mod host;
pub mod msgpack;
mod registry;
mod traits;

pub use self::{
    cell::{CellKind, ChangeHook, Region, TypeCode, Value},
    config::{Encoding, HostConfig, ProcessingMode, ProtocolInfo, StrobeDynamics, STROBE_SLOWEST},
    crc::CrcWidth,
    error::{ConfigError, Errno},
    host::{Host, PROTOCOL_VERSION},
    traits::{Hooks, Link, NoHooks, SendError},
};
