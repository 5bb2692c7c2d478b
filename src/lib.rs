//! podrelay: forwards podping event files to an HTTP endpoint.
//!
//! A producer drops one JSON file per podping into a directory. The relay
//! watches that directory, waits for each file to finish being written,
//! POSTs its content to `<endpoint>/<reason>` under a bounded concurrency
//! limit, and keeps an eye on the producer: too many consecutive delivery
//! failures, or too long without a new file, and the producer's checkpoint
//! is rewound and it is restarted through the process supervisor.
//!
//! # Example
//!
//! ```ignore
//! use podrelay::{Config, Relay};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load(Some("podrelay.yaml".as_ref()))?;
//! let state = Relay::from_config(config)?.run(CancellationToken::new()).await?;
//! println!("{} consecutive failures at exit", state.consecutive_failures);
//! ```

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod forward;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod relay;
pub mod signal;
pub mod watcher;

// Re-export main types
pub use config::Config;
pub use event::Event;
pub use health::{HealthHandle, HealthState, Outcome, RecoveryTrigger};
pub use relay::{GatedForwarder, Relay};
