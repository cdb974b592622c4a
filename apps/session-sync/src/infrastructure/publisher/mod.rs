//! Event publisher and user resolver adapters used by the binary.

/// Publisher that writes events to the log.
pub mod logging;

/// In-memory user resolver.
pub mod user_resolver;

pub use logging::LoggingEventPublisher;
pub use user_resolver::InMemoryUserResolver;
