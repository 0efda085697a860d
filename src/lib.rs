#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate talks to JBD ("xiaoxiang") battery management systems over their
//! Bluetooth LE interface. It builds command frames, reassembles responses that
//! arrive split over several notifications, matches them to the pending request
//! and decodes telemetry and cell voltages. It can also switch the charge and
//! discharge MOSFETs.
//!
//! The protocol core is independent of the Bluetooth stack: anything that can
//! write bytes ([`transport::Transport`]) and deliver notification chunks
//! ([`transport::NotificationSink`]) can drive a [`client::JbdBms`].
//!
//! ## Features
//!
//! - `ble`: Enables [`ble`], a transport built on the `bluest` crate.
//! - `serde`: Enables `serde` support for the decoded data structures.
//! - `bin-dependencies`: Enables everything required by the `jbdbms` command-line tool.

/// Contains error types for the library.
mod error;
/// Reassembles notification chunks into frames.
pub mod assembler;
/// Asynchronous client for one BMS connection.
pub mod client;
mod dispatcher;
/// Frame layout, checksum and payload decoding.
pub mod protocol;
/// The link primitives the client is built on.
pub mod transport;

pub use error::{Error, Result};

/// Bluetooth LE transport.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
