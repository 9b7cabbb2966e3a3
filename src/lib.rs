// (c) 2025 Ross Younger

//! `smplink` is a client library for the MCU Manager (MCUmgr) management
//! protocol, as served by MCUboot/Zephyr devices over BLE, serial or UDP.
//!
//! ## Overview
//!
//! - 🔎 Inspect and manipulate firmware image slots (list, test, confirm, erase)
//! - 🚀 Upload firmware images with a sliding window of in-flight chunks
//! - 📁 Read and write files on the device filesystem
//! - 🖥️ OS-level commands (echo, reset, buffer parameter query)
//! - 📦 Decode MCUboot image binaries and multi-image ZIP update packages
//!
//! The library does not own a transport. It is handed a [`FramePair`] (a
//! sink and source of complete SMP datagrams) and a host tokio runtime, and
//! builds the request/response machinery on top:
//!
//! ```text
//! caller ──▶ uploader/downloader ──▶ command builders ──▶ codec ──▶ transport
//!                    ▲                                                 │
//!                    └──────────── response router ◀──────────────────┘
//! ```
//!
//! Frames are correlated to requests by `(group, id, sequence)`; the transfer
//! engines drive their windows from the device's acknowledged offsets, so a
//! lost or replayed chunk costs a resync rather than the whole transfer.
//!
//! ## Getting started
//!
//! ```no_run
//! use smplink::{FramePair, SmpClient};
//! use std::time::Duration;
//!
//! async fn demo<S, R>(transport: FramePair<S, R>) -> smplink::Result<()>
//! where
//!     S: smplink::FrameSink + 'static,
//!     R: smplink::FrameSource + 'static,
//! {
//!     let client = SmpClient::open(transport);
//!     let greeting = client.echo("hello", Duration::from_secs(1)).await?;
//!     println!("device says: {greeting}");
//!     client.close().await
//! }
//! ```
//!
//! ## What smplink is not
//!
//! * A transport. Bring your own BLE characteristic, serial framer or socket;
//!   anything satisfying [`FrameSink`] + [`FrameSource`] will do.
//! * A device-side (server) implementation.
//! * A discovery or provisioning mechanism.
//!
//! [`FramePair`]: transport::FramePair

mod client;
pub use client::os::BufferParams;
pub use client::{ImageSlot, ImageState, SmpClient};

mod error;
pub use error::{Error, Result};

pub mod firmware;
pub mod protocol;

mod transfer;
pub use transfer::download::FileDownload;
pub use transfer::upload::{DataUpload, ImageUpload};
pub use transfer::{DEFAULT_TIMEOUT, Progress};

pub mod transport;
pub use transport::{FramePair, FrameSink, FrameSource};
