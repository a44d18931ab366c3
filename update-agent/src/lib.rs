//! Over-the-air firmware updates for paired hardware wallets.
//!
//! An [`UpdateSession`] drives a device through version check, download, flashing and
//! post-flash verification for every offered firmware candidate, on a background worker.
//! Devices are reached through a [`transport::TransportFactory`], images are fetched by a
//! [`download::Fetch`] implementation into an [`artifact::ArtifactStore`].
#![forbid(unsafe_code)]

pub mod artifact;
pub mod client;
pub mod download;
pub mod flash;
pub mod json;
pub mod machine;
pub mod progress;
pub mod records;
pub mod registry;
pub mod session;
pub mod settings;
pub mod transport;
pub mod util;

pub use machine::{Decision, UpdateOptions, decide};
pub use progress::{EventSink, LogSink, UpdateEvent};
pub use registry::SessionRegistry;
pub use session::{SessionError, SessionReport, UpdateContext, UpdateSession};
pub use settings::{Args, Settings};
