//! vlinkd — fleet-management daemon for a PCIe camera cluster.
//!
//! A root complex (RC) node accepts TCP connections from satellite nodes that
//! register as crew stations (stream consumers) or concentrators (camera
//! producers), hands each peer the configuration slice for its role, and
//! tracks multicast group membership. The non-RC roles run as short-lived CLI
//! clients of the RC.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod net;
pub mod util;

pub use error::{Error, ErrorKind, Result};
