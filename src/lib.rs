//! # Meshframe
//!
//! **A lightweight service mesh fabric over a shared coordinator**
//!
//! Meshframe lets a fleet of service instances find each other, route HTTP
//! requests, and pass messages without a dedicated control-plane process.
//! Every instance shares one coordinator store (Redis in production, an
//! in-memory stand-in for tests) and uses it for presence, health, route
//! registration, pub/sub, and queueing.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! meshframe = "0.1"
//! ```
//!
//! ```rust,ignore
//! use meshframe::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fabric = Fabric::builder("orders-service").build().await?;
//!     fabric.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! See the `meshframe-core` crate for the full module breakdown: presence,
//! discovery, route registry, message bus, queues, and HTTP dispatch.

// Re-export everything from meshframe-core
pub use meshframe_core::*;
