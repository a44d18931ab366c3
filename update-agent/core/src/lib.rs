#![forbid(unsafe_code)]
#![warn(unreachable_pub)]

pub mod cancel;
pub mod candidate;
pub mod device;
pub mod file_location;
pub mod outcome;
pub mod telemetry;
pub mod version;

pub use cancel::CancellationController;
pub use candidate::{CandidateRecord, FirmwareCandidate};
pub use device::{ComponentId, Device, DeviceId, TransportKind};
pub use file_location::LocalOrRemote;
pub use outcome::{Failure, FailureReason, Outcome, Phase};
pub use version::{FirmwareVersion, InvalidVersionFormat};
