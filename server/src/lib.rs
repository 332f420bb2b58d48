//! Pulsegate
//!
//! Resumable-session, quality-adaptive WebSocket gateway core. Provides
//! a binary-framed session protocol with adaptive heartbeating and a
//! persistent connection pool with LRU eviction.

pub mod codec;
pub mod config;
pub mod error;
pub mod pool;
pub mod quality;
pub mod server;
pub mod session;
