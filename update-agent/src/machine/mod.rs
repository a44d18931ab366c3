//! The update state machine.
//!
//! Every candidate is driven through `CheckingVersion → Downloading → Flashing →
//! VerifyingDevice` until it reaches an [`Outcome`]. Each phase handler returns a
//! [`Transition`]; the driver loop checks for cancellation before entering any phase.
//! The transport session is opened lazily on the first flash and disconnected when the
//! machine is done, whatever the outcome.
use std::cmp::Ordering;

use tracing::{debug, info, warn};
use wallet_update_agent_core::{
    CancellationController, CandidateRecord, ComponentId, Device, FailureReason,
    FirmwareCandidate, FirmwareVersion, InvalidVersionFormat, Outcome, Phase,
    version::compare,
};

use crate::{
    artifact::{ArtifactReader, ArtifactStore, StoreError},
    download::{DownloadError, Fetch},
    flash::{Flash as _, FlashContext, FlashError, FlashMethod, query_features},
    progress::ProgressReporter,
    records::CandidateRecords,
    transport::{RejectCode, SessionGuard, TransportError, TransportFactory},
};


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Flash even if the device already runs the candidate version or newer.
    pub force: bool,
}

/// Result of the version check for one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    NeedsBackupFirst,
    AlreadyLatest,
    Update,
}

/// Decides whether `candidate` should be installed on `device`.
///
/// An initialized device that still needs a backup never gets main firmware. A device in
/// bootloader mode is always updated, and so is every device when `force` is set.
/// Otherwise the candidate must be strictly newer than the installed version, where a
/// component without a reported version counts as `0`.
pub fn decide(
    device: &Device,
    candidate: &FirmwareCandidate,
    force: bool,
) -> Result<Decision, InvalidVersionFormat> {
    if device.initialized && device.needs_backup && candidate.component == ComponentId::Main
    {
        return Ok(Decision::NeedsBackupFirst);
    }
    let offered = FirmwareVersion::parse(&candidate.version)?;
    if force || device.bootloader_mode {
        return Ok(Decision::Update);
    }
    let installed = FirmwareVersion::parse(
        device.installed_version(candidate.component).unwrap_or("0"),
    )?;
    if offered <= installed {
        Ok(Decision::AlreadyLatest)
    } else {
        Ok(Decision::Update)
    }
}

/// Combines per component outcomes into the session outcome.
pub fn aggregate(outcomes: &[Outcome]) -> Outcome {
    if let Some(last) = outcomes.last().filter(|o| o.stops_session()) {
        return last.clone();
    }
    if outcomes.contains(&Outcome::Completed) {
        Outcome::Completed
    } else {
        Outcome::AlreadyLatest
    }
}

enum Transition {
    Next(Phase),
    Finish(Outcome),
}

pub struct UpdateStateMachine<'a> {
    device: &'a mut Device,
    store: &'a ArtifactStore,
    fetcher: &'a dyn Fetch,
    transports: &'a dyn TransportFactory,
    records: &'a dyn CandidateRecords,
    reporter: &'a ProgressReporter,
    cancel: &'a CancellationController,
    options: UpdateOptions,
    session: Option<SessionGuard>,
}

impl<'a> UpdateStateMachine<'a> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        device: &'a mut Device,
        store: &'a ArtifactStore,
        fetcher: &'a dyn Fetch,
        transports: &'a dyn TransportFactory,
        records: &'a dyn CandidateRecords,
        reporter: &'a ProgressReporter,
        cancel: &'a CancellationController,
        options: UpdateOptions,
    ) -> Self {
        Self {
            device,
            store,
            fetcher,
            transports,
            records,
            reporter,
            cancel,
            options,
            session: None,
        }
    }

    /// Processes `candidates` in order, stopping at the first outcome that ends the
    /// session. The terminal result is left to the caller to report.
    pub fn run(mut self, candidates: &[FirmwareCandidate]) -> Outcome {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let outcome = self.run_component(candidate);
            self.reporter.report_component(candidate.component, &outcome);
            let stop = outcome.stops_session();
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        // disconnects
        self.session.take();
        aggregate(&outcomes)
    }

    fn run_component(&mut self, candidate: &FirmwareCandidate) -> Outcome {
        let component = candidate.component;
        info!(
            "updating {component} of device `{}` to {}",
            self.device.id, candidate.version
        );
        let mut phase = Phase::CheckingVersion;
        loop {
            if self.cancel.is_cancelled() {
                info!("{component}: cancelled before {phase}");
                return Outcome::Cancelled;
            }
            self.reporter.report_phase(component, phase);
            let transition = match phase {
                Phase::CheckingVersion => self.check_version(candidate),
                Phase::Downloading => self.download(candidate),
                Phase::Flashing => self.flash(candidate),
                Phase::VerifyingDevice => self.verify(candidate),
            };
            match transition {
                Transition::Next(next) => {
                    debug!("{component}: {phase} -> {next}");
                    phase = next;
                }
                Transition::Finish(outcome) => {
                    info!("{component}: {phase} finished with {outcome}");
                    return outcome;
                }
            }
        }
    }

    fn check_version(&mut self, candidate: &FirmwareCandidate) -> Transition {
        match decide(self.device, candidate, self.options.force) {
            Ok(Decision::NeedsBackupFirst) => Transition::Finish(Outcome::NeedsBackupFirst),
            Ok(Decision::AlreadyLatest) => Transition::Finish(Outcome::AlreadyLatest),
            Ok(Decision::Update) => Transition::Next(Phase::Downloading),
            Err(e) => Transition::Finish(Outcome::failed(
                FailureReason::InvalidVersionFormat,
                e.to_string(),
            )),
        }
    }

    fn download(&mut self, candidate: &FirmwareCandidate) -> Transition {
        let component = candidate.component;
        if self
            .store
            .has(component, &candidate.version, candidate.checksum.as_deref())
        {
            info!("{component} {} already cached, skipping download", candidate.version);
        } else {
            if !candidate.needs_upload {
                warn!(
                    "{component} {} was recorded as downloaded but is not cached",
                    candidate.version
                );
            }
            if let Err(outcome) = self.fetch(candidate) {
                return Transition::Finish(outcome);
            }
        }

        match self.store.verify(component, candidate.checksum.as_deref()) {
            Ok(artifact) => {
                debug!("verified `{}`", artifact.path.display());
                self.reporter.report(component, Phase::Downloading, 100);
                Transition::Next(Phase::Flashing)
            }
            Err(e) => {
                if matches!(e, StoreError::CorruptArtifact { .. }) {
                    self.discard(component);
                }
                Transition::Finish(store_failure(e))
            }
        }
    }

    fn fetch(&mut self, candidate: &FirmwareCandidate) -> Result<(), Outcome> {
        let component = candidate.component;
        let reporter = self.reporter;
        let mut writer = self.store.reserve(component).map_err(store_failure)?;
        reporter.report(component, Phase::Downloading, 0);
        let mut on_progress = |done: u64, total: Option<u64>| {
            reporter.report_bytes(component, Phase::Downloading, done, total);
        };
        // an uncommitted writer removes the partial file when dropped
        let fetched = self
            .fetcher
            .fetch(&candidate.source, &mut writer, self.cancel, &mut on_progress)
            .map_err(download_failure)?;
        writer
            .commit(&candidate.version, candidate.checksum.as_deref())
            .map_err(store_failure)?;
        info!("downloaded {fetched} bytes of {component} {}", candidate.version);

        let record = CandidateRecord {
            version: candidate.version.clone(),
            needs_upload: false,
        };
        if let Err(e) = self.records.put(component, record) {
            warn!("failed recording downloaded {component} candidate: {e:?}");
        }
        Ok(())
    }

    fn flash(&mut self, candidate: &FirmwareCandidate) -> Transition {
        let component = candidate.component;
        let image = match self.store.open(component).and_then(ArtifactReader::into_bytes) {
            Ok(image) => image,
            Err(e) => return Transition::Finish(store_failure(e)),
        };

        let reporter = self.reporter;
        let cancel = self.cancel;
        let address = self.device.address.clone();
        let session = match self.connected_session() {
            Ok(session) => session,
            Err(e) => return Transition::Finish(transport_failure(e)),
        };
        let method = FlashMethod::for_transport(session.kind());
        let mut on_progress = |percent: u8| reporter.report(component, Phase::Flashing, percent);
        let mut ctx = FlashContext {
            component,
            address: &address,
            cancel,
            on_progress: &mut on_progress,
        };

        match method.flash(&mut **session, &image, &mut ctx) {
            Ok(()) => Transition::Next(Phase::VerifyingDevice),
            Err(e) => {
                let outcome = flash_failure(e);
                if matches!(&outcome, Outcome::Failed(f) if f.reason == FailureReason::CorruptArtifact)
                {
                    self.discard(component);
                }
                Transition::Finish(outcome)
            }
        }
    }

    fn verify(&mut self, candidate: &FirmwareCandidate) -> Transition {
        let component = candidate.component;
        let address = self.device.address.clone();
        let features = match self.connected_session() {
            Ok(session) => match query_features(&mut **session) {
                Err(FlashError::Transport(e)) if e.is_link_lost() => {
                    // the device restarts into the new firmware after flashing
                    debug!("reconnecting after flash: {e}");
                    session
                        .connect(&address)
                        .map_err(FlashError::from)
                        .and_then(|()| query_features(&mut **session))
                }
                other => other,
            },
            Err(e) => Err(FlashError::Transport(e)),
        };
        let features = match features {
            Ok(features) => features,
            Err(e) => return Transition::Finish(flash_failure(e)),
        };

        let Some(reported) = features.version_of(component) else {
            return Transition::Finish(Outcome::failed(
                FailureReason::VerificationMismatch,
                format!("device reports no {component} version after flashing"),
            ));
        };
        match compare(reported, &candidate.version) {
            Ok(Ordering::Equal) => {
                info!("device now runs {component} {reported}");
                self.device.record_flashed_version(component, reported);
                Transition::Finish(Outcome::Completed)
            }
            Ok(_) => Transition::Finish(Outcome::failed(
                FailureReason::VerificationMismatch,
                format!(
                    "device reports {component} {reported}, expected {}",
                    candidate.version
                ),
            )),
            Err(e) => Transition::Finish(Outcome::failed(
                FailureReason::VerificationMismatch,
                e.to_string(),
            )),
        }
    }

    fn connected_session(&mut self) -> Result<&mut SessionGuard, TransportError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => SessionGuard::new(self.transports.open_session(self.device.transport)?),
        };
        let session = self.session.insert(session);
        if !session.is_alive() {
            session.connect(&self.device.address)?;
        }
        Ok(session)
    }

    fn discard(&self, component: ComponentId) {
        if let Err(e) = self.store.discard(component) {
            warn!("failed discarding {component} artifact: {e:?}");
        }
    }
}

fn store_failure(err: StoreError) -> Outcome {
    let reason = match &err {
        StoreError::ArtifactMissing(_) => FailureReason::ArtifactMissing,
        StoreError::IntegrityCheckFailed { .. } => FailureReason::IntegrityCheckFailed,
        StoreError::CorruptArtifact { .. } => FailureReason::CorruptArtifact,
        StoreError::WriteInProgress(_) | StoreError::Io { .. } | StoreError::Marker { .. } => {
            FailureReason::Storage
        }
    };
    Outcome::failed(reason, format!("{err:#}"))
}

fn download_failure(err: DownloadError) -> Outcome {
    let reason = match &err {
        DownloadError::Cancelled(_) => return Outcome::Cancelled,
        DownloadError::Timeout { .. } => FailureReason::DownloadTimeout,
        DownloadError::Write(_) => FailureReason::Storage,
        DownloadError::NetworkFailure { .. }
        | DownloadError::InsecureUrl(_)
        | DownloadError::Client(_) => FailureReason::NetworkFailure,
    };
    Outcome::failed(reason, err.to_string())
}

fn transport_failure(err: TransportError) -> Outcome {
    let reason = match &err {
        TransportError::Rejected {
            code: RejectCode::ActionCancelled,
            ..
        } => return Outcome::Cancelled,
        TransportError::Rejected {
            code: RejectCode::InvalidImage,
            ..
        } => FailureReason::CorruptArtifact,
        TransportError::Rejected { .. } => FailureReason::Rejected,
        TransportError::NotConnected
        | TransportError::ConnectFailed { .. }
        | TransportError::LinkLost { .. }
        | TransportError::Unavailable(_) => FailureReason::LinkLost,
    };
    Outcome::failed(reason, err.to_string())
}

fn flash_failure(err: FlashError) -> Outcome {
    let reason = match err {
        FlashError::Transport(e) => return transport_failure(e),
        FlashError::Cancelled => return Outcome::Cancelled,
        FlashError::CorruptImage(_) | FlashError::ImageTooLarge(_) => {
            FailureReason::CorruptArtifact
        }
        FlashError::BootloaderUnavailable => FailureReason::BootloaderUnavailable,
        FlashError::ChecksumMismatch { .. } => FailureReason::TransferChecksum,
        FlashError::UnexpectedResponse { .. } => FailureReason::ProtocolViolation,
    };
    Outcome::failed(reason, err.to_string())
}
