//! Performance-counter sample capture, packet transport and per-process
//! trace splitting.

pub mod capture;
pub mod config;
pub mod demux;
pub mod encoder;
pub mod export;
pub mod identity;
pub mod sender;
pub mod transport;
pub mod wire;
