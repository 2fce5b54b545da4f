//! Connection management for the peripheral link
//!
//! This module handles:
//! - Discovery of the peripheral by advertised name
//! - Connect + notification subscribe with a timeout
//! - Link-loss detection and automatic reconnection with backoff
//! - Serialised writes on behalf of the outbound bridge

mod manager;

pub use manager::{Backoff, ConnectionConfig, ConnectionHandle, ConnectionManager};
