//! Application Layer
//!
//! Orchestrates the domain through two kinds of items:
//!
//! - **Ports**: Interfaces for upstream servers, realtime feeds and
//!   downstream consumers
//! - **Services**: Pollers and managers running as background tasks

pub mod ports;
pub mod services;

pub use ports::*;
pub use services::*;
