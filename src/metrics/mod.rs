//! Metrics and observability infrastructure.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus recorder and HTTP endpoint

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the given event, recording the
/// corresponding metric. Without an installed recorder this is a no-op.
///
/// ```ignore
/// use podrelay::metrics::events::{FileSkipped, SkipReason};
///
/// emit!(FileSkipped { reason: SkipReason::Parse });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
