//! Forwards local TCP and UDP ports to remote targets, with mappings that
//! can be added, changed and removed while traffic flows.

#[macro_use]
extern crate tracing;

#[macro_use]
mod display;

pub mod app;
pub mod config;
pub mod forward;
mod signal;

pub use self::forward::{Error, Forwarder, ListenOpts, LocalSpec, Mapping, Target};
