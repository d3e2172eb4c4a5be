//! # PBX Integration (ARI)
//!
//! ## Key Components:
//! - **client**: persistent event stream with reconnect (`EventStreamClient`)
//! - **event**: decoding of event payloads into `AriEvent`
//! - **commands**: call-control REST commands behind the `PbxCommands` trait
//! - **backoff**: reconnect delay schedule

pub mod backoff;
pub mod client;
pub mod commands;
pub mod event;

pub use client::{EventStreamClient, StreamStatus};
pub use commands::{AriCommands, ExternalMedia, PbxCommands};
pub use event::AriEvent;
