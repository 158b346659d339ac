//! Event sinks for pipeline observability.
//!
//! The executor publishes `pipeline.*`, `stage.*` and `attempt.*` events to
//! the sink it was built with.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
