//! Application Ports
//!
//! Driven ports implemented by infrastructure adapters.

mod event_publisher_port;
mod history_sync_port;
mod realtime_feed;
mod session_source;
mod user_resolver_port;

pub use event_publisher_port::{EventPublishError, EventPublisherPort, NoOpEventPublisher};
pub use history_sync_port::{HistorySyncError, HistorySyncPort, NoOpHistorySync};
pub use realtime_feed::{PushSender, RealtimeError, RealtimeFeed, SessionPush};
pub use session_source::{SessionSource, SourceError};
pub use user_resolver_port::{UserLookup, UserResolveError, UserResolverPort};

#[cfg(test)]
pub use event_publisher_port::MockEventPublisherPort;
#[cfg(test)]
pub use history_sync_port::MockHistorySyncPort;
#[cfg(test)]
pub use session_source::{MockSessionSource, StubSession};
#[cfg(test)]
pub use user_resolver_port::MockUserResolverPort;
