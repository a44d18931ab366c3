//! Update sessions running on a background worker.
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{info, warn};
use wallet_update_agent_core::{
    CancellationController, Device, DeviceId, FirmwareCandidate, Outcome,
    candidate::{DuplicateComponent, sort_candidates},
};

use crate::{
    artifact::ArtifactStore,
    download::Fetch,
    machine::{UpdateOptions, UpdateStateMachine},
    progress::{EventSink, ProgressReporter, UpdateEvent},
    records::CandidateRecords,
    registry::SessionRegistry,
    transport::TransportFactory,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("an update session is already active for device `{0}`")]
    SessionAlreadyActive(DeviceId),
    #[error(transparent)]
    DuplicateComponent(#[from] DuplicateComponent),
    #[error("failed spawning update worker")]
    Spawn(#[source] io::Error),
}

/// Collaborators shared by all sessions.
#[derive(Clone)]
pub struct UpdateContext {
    pub store: Arc<ArtifactStore>,
    pub fetcher: Arc<dyn Fetch>,
    pub transports: Arc<dyn TransportFactory>,
    pub records: Arc<dyn CandidateRecords>,
    /// Receive every event of every session, in addition to each session's own channel.
    pub sinks: Vec<Arc<dyn EventSink>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: Outcome,
    /// The device with its installed versions refreshed.
    pub device: Device,
}

/// A running update of one device.
///
/// Dropping the session before it finished cancels it and waits for the worker.
pub struct UpdateSession {
    device: DeviceId,
    cancel: CancellationController,
    events: flume::Receiver<UpdateEvent>,
    finished: Arc<AtomicBool>,
    worker: Option<jod_thread::JoinHandle<SessionReport>>,
}

impl UpdateSession {
    /// Starts updating `device` to `candidates` on a background worker.
    ///
    /// Fails immediately, without touching the running session, if `device` is already
    /// being updated.
    pub fn start(
        registry: &SessionRegistry,
        device: Device,
        candidates: Vec<FirmwareCandidate>,
        options: UpdateOptions,
        context: &UpdateContext,
    ) -> Result<Self, SessionError> {
        let candidates = sort_candidates(candidates)?;
        let lease = registry
            .try_acquire(&device.id)
            .ok_or_else(|| SessionError::SessionAlreadyActive(device.id.clone()))?;

        let device_id = device.id.clone();
        let cancel = CancellationController::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (events_tx, events) = flume::unbounded();
        let mut sinks = context.sinks.clone();
        sinks.push(Arc::new(events_tx));

        let worker = {
            let device_id = device_id.clone();
            let cancel = cancel.clone();
            let finished = Arc::clone(&finished);
            let context = context.clone();
            jod_thread::Builder::new()
                .name(format!("update-{device_id}"))
                .spawn(move || {
                    let mut device = device;
                    let reporter = ProgressReporter::new(sinks);
                    let outcome = UpdateStateMachine::new(
                        &mut device,
                        &context.store,
                        context.fetcher.as_ref(),
                        context.transports.as_ref(),
                        context.records.as_ref(),
                        &reporter,
                        &cancel,
                        options,
                    )
                    .run(&candidates);
                    info!("update of device `{device_id}` finished: {outcome}");
                    drop(lease);
                    finished.store(true, Ordering::Release);
                    reporter.report_terminal(&outcome);
                    SessionReport { outcome, device }
                })
                .map_err(SessionError::Spawn)?
        };

        info!("started update session for device `{device_id}`");
        Ok(Self {
            device: device_id,
            cancel,
            events,
            finished,
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Requests cancellation. Only the first request has an effect.
    pub fn cancel(&self) -> bool {
        let first = self.cancel.cancel();
        if first {
            info!("cancelling update of device `{}`", self.device);
        }
        first
    }

    /// Phase, progress and terminal events of this session.
    pub fn events(&self) -> flume::Receiver<UpdateEvent> {
        self.events.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Blocks until the worker is done.
    pub fn join(mut self) -> SessionReport {
        match self.worker.take() {
            Some(worker) => worker.join(),
            // `join` consumes the session, nothing else takes the worker
            None => unreachable!("update worker already joined"),
        }
    }
}

impl Drop for UpdateSession {
    fn drop(&mut self) {
        if self.worker.is_some() && !self.is_finished() {
            warn!(
                "update session of device `{}` dropped while running, cancelling",
                self.device
            );
            self.cancel.cancel();
        }
    }
}
