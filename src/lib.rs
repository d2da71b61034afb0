//! # zbgateway - Serial Gateway for Wireless End-Devices
//!
//! zbgateway bridges a fleet of battery-powered wireless end-devices, reachable
//! only through a single half-duplex serial coordinator, to an upstream
//! telemetry/command bus.
//!
//! ## Features
//!
//! - **Checksummed Text Frames**: `ID:<id>,SECRET_KEY:<key>,CMD:<verb>,CRC:<hex8>` with CRC-32 integrity.
//! - **Single-In-Flight Dispatch**: strict FIFO command queue with per-attempt reply timeout and bounded retry.
//! - **Device Lifecycle**: pending and active device sets, promotion on contact, eviction of stale pending devices.
//! - **Telemetry**: `DATA:` payloads become named metrics in a bounded queue forwarded to an uplink.
//! - **Async Runtime**: the dispatch loop and the uplink forwarder run as Tokio tasks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "serial")]
//! # {
//! use zbgateway::config::Config;
//! use zbgateway::gateway::{Gateway, SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let link = SerialTransport::open(&config.serial.port, config.serial.baud_rate).await?;
//!     let mut gateway = Gateway::new(link, &config.gateway);
//!     let handle = gateway.handle();
//!     handle.broadcast_discovery();
//!
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     gateway.run(shutdown).await;
//!     Ok(())
//! }
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - Protocol engine: checksum, frames, registry, dispatcher, transports
//! - [`telemetry`] - Metric parsing, bounded metric queue, uplink forwarding
//! - [`config`] - Configuration loading and validation
//! - [`metrics`] - Serial link counters
//! - [`validation`] - Checks on ids, verbs and keys before they reach the wire
//! - [`logutil`] - Log-safe rendering of raw serial data
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Uplink        │ ← metrics / attributes / device list
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Gateway       │ ← registry, dispatcher, periodic tick
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial coordinator
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod telemetry;
pub mod validation;
