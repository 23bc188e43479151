#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate talks to JBD style BMS (Battery Management System) devices over
//! their serial protocol. It reads the pack status (register 0x03) and the
//! cell voltages (register 0x04) and decodes them into typed records.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jbdbms` command-line tool.
//!
//! ### Client Features
//! - `tokio-serial-async`: Enables the **asynchronous** request/response correlator using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing the decoded records.
//! - `bin-dependencies`: Enables all features required by the `jbdbms` binary executable.

/// Contains error types for the library.
mod error;
/// Converts raw bytes into typed values and flag sets.
pub mod fields;
/// Splits the incoming byte stream into frames.
pub mod framer;
/// Defines the communication protocol for JBD BMS.
pub mod protocol;

pub use error::Error;

/// Pairs requests with responses over one transport.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod correlator;

/// Asynchronous serial port client for JBD BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
