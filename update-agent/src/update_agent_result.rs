use std::process::{ExitCode, Termination};

use wallet_update_agent::{artifact::StoreError, download::DownloadError};
use wallet_update_agent_core::InvalidVersionFormat;

/// Exit codes returned by the update agent. Custom exit codes are taken in accordance with the
/// Linux Standard Base Core Specification and are in the range 150-199.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdateAgentResult {
    Success = 0,
    Failure = 1,
    DownloadFailed = 150,
    InvalidVersion = 151,
    CorruptArtifact = 152,
}

impl Termination for UpdateAgentResult {
    fn report(self) -> ExitCode {
        ExitCode::from(self as u8)
    }
}

impl From<eyre::Report> for UpdateAgentResult {
    fn from(err: eyre::Report) -> Self {
        use UpdateAgentResult::{CorruptArtifact, DownloadFailed, Failure, InvalidVersion};
        if err.downcast_ref::<DownloadError>().is_some() {
            return DownloadFailed;
        }
        if err.downcast_ref::<InvalidVersionFormat>().is_some() {
            return InvalidVersion;
        }
        match err.downcast_ref::<StoreError>() {
            Some(
                StoreError::IntegrityCheckFailed { .. } | StoreError::CorruptArtifact { .. },
            ) => CorruptArtifact,
            _ => Failure,
        }
    }
}
