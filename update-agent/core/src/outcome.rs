use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The non-terminal phases an update passes through, in order.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CheckingVersion,
    Downloading,
    Flashing,
    VerifyingDevice,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::CheckingVersion => "checking_version",
            Phase::Downloading => "downloading",
            Phase::Flashing => "flashing",
            Phase::VerifyingDevice => "verifying_device",
        };
        f.write_str(s)
    }
}

/// Terminal result of an update, for a single component or a whole session.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    AlreadyLatest,
    NeedsBackupFirst,
    Failed(Failure),
    Cancelled,
}

impl Outcome {
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self::Failed(Failure {
            reason,
            detail: detail.into(),
        })
    }

    /// `true` for outcomes after which no further component is processed.
    pub fn stops_session(&self) -> bool {
        matches!(
            self,
            Outcome::NeedsBackupFirst | Outcome::Failed(_) | Outcome::Cancelled
        )
    }

    /// Stable identifier for rendering one message per cause.
    pub fn code(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::AlreadyLatest => "already_latest",
            Outcome::NeedsBackupFirst => "needs_backup_first",
            Outcome::Failed(failure) => failure.reason.code(),
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Failed(failure) => write!(f, "failed ({failure})"),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub detail: String,
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.code(), self.detail)
    }
}

/// Why a session failed. Each variant maps to exactly one user-facing message.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidVersionFormat,
    ArtifactMissing,
    IntegrityCheckFailed,
    CorruptArtifact,
    NetworkFailure,
    DownloadTimeout,
    Storage,
    LinkLost,
    Rejected,
    BootloaderUnavailable,
    TransferChecksum,
    ProtocolViolation,
    VerificationMismatch,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::InvalidVersionFormat => "invalid_version_format",
            FailureReason::ArtifactMissing => "artifact_missing",
            FailureReason::IntegrityCheckFailed => "integrity_check_failed",
            FailureReason::CorruptArtifact => "corrupt_artifact",
            FailureReason::NetworkFailure => "network_failure",
            FailureReason::DownloadTimeout => "download_timeout",
            FailureReason::Storage => "storage",
            FailureReason::LinkLost => "link_lost",
            FailureReason::Rejected => "rejected",
            FailureReason::BootloaderUnavailable => "bootloader_unavailable",
            FailureReason::TransferChecksum => "transfer_checksum",
            FailureReason::ProtocolViolation => "protocol_violation",
            FailureReason::VerificationMismatch => "verification_mismatch",
        }
    }
}
