//! # marker-bridge
//!
//! Streams marker poses from an external camera tracker, expresses them
//! relative to an anchor marker and aligns them into the consumer's
//! reference space.
//!
//! Two independent ingestion paths feed the same pipeline:
//! - [`transport`]: WebSocket client polling a tracking server, decoded by
//!   [`decoder`] into the [`store`]
//! - [`relay`]: UDP server aggregating per-frame tracker batches
//!
//! [`pipeline`] ticks both through [`calibration`] and [`aligner`].

pub mod aligner;
pub mod calibration;
pub mod config;
pub mod decoder;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod relay;
pub mod rolling_log;
pub mod store;
pub mod ticker;
pub mod transport;

pub use config::BridgeConfig;
pub use error::{Error, Result};
