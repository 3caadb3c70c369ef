//! Library crate backing the `sensor-daemon` binary: an SCD40 acquisition
//! loop, an LSM-backed time-series store, and a read-only HTTP query
//! surface, glued together by a daemon control loop.

pub mod aggregate;
pub mod config;
pub mod crc;
pub mod daemon;
pub mod error;
pub mod health;
pub mod http;
pub mod reading;
pub mod sensor;
pub mod storage;

pub use error::DaemonResult;
