//! Coalescing of phase and percent notifications before they reach the event sinks.
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;
use wallet_update_agent_core::{ComponentId, Outcome, Phase};

use crate::util::percent;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Phase {
        component: ComponentId,
        phase: Phase,
    },
    Progress {
        component: ComponentId,
        phase: Phase,
        percent: u8,
    },
    ComponentDone {
        component: ComponentId,
        outcome: Outcome,
    },
    Terminal {
        outcome: Outcome,
    },
}

/// Fire-and-forget receiver of update events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: UpdateEvent);
}

impl EventSink for flume::Sender<UpdateEvent> {
    fn publish(&self, event: UpdateEvent) {
        // nobody listening is fine
        let _ = self.send(event);
    }
}

/// Writes every event to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: UpdateEvent) {
        match event {
            UpdateEvent::Phase { component, phase } => info!("{component}: entering {phase}"),
            UpdateEvent::Progress {
                component,
                phase,
                percent,
            } => info!("{component}: {phase} {percent}%"),
            UpdateEvent::ComponentDone { component, outcome } => {
                info!("{component}: {outcome}")
            }
            UpdateEvent::Terminal { outcome } => info!("update finished: {outcome}"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    current: Option<(ComponentId, Phase)>,
    percent: Option<u8>,
    finished: bool,
}

/// Forwards phase changes once, percent updates only when they grow by at least one
/// point, and the terminal result exactly once. Nothing is forwarded after the terminal
/// result.
pub struct ProgressReporter {
    sinks: Vec<Arc<dyn EventSink>>,
    state: Mutex<State>,
}

impl ProgressReporter {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks,
            state: Mutex::default(),
        }
    }

    fn publish(&self, event: UpdateEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announces that `component` entered `phase`, unless it already did.
    pub fn report_phase(&self, component: ComponentId, phase: Phase) {
        let mut state = self.state();
        if state.finished || state.current == Some((component, phase)) {
            return;
        }
        state.current = Some((component, phase));
        state.percent = None;
        drop(state);
        self.publish(UpdateEvent::Phase { component, phase });
    }

    pub fn report(&self, component: ComponentId, phase: Phase, percent: u8) {
        self.report_phase(component, phase);
        let percent = percent.min(100);
        let mut state = self.state();
        if state.finished || state.current != Some((component, phase)) {
            return;
        }
        if state.percent.is_some_and(|last| percent <= last) {
            return;
        }
        state.percent = Some(percent);
        drop(state);
        self.publish(UpdateEvent::Progress {
            component,
            phase,
            percent,
        });
    }

    /// Byte based progress. Without a known total only the phase is announced.
    pub fn report_bytes(
        &self,
        component: ComponentId,
        phase: Phase,
        done: u64,
        total: Option<u64>,
    ) {
        match total {
            Some(total) => self.report(component, phase, percent(done, total)),
            None => self.report_phase(component, phase),
        }
    }

    pub fn report_component(&self, component: ComponentId, outcome: &Outcome) {
        if self.state().finished {
            return;
        }
        self.publish(UpdateEvent::ComponentDone {
            component,
            outcome: outcome.clone(),
        });
    }

    /// Returns `false` if a terminal result was already reported.
    pub fn report_terminal(&self, outcome: &Outcome) -> bool {
        let mut state = self.state();
        if state.finished {
            return false;
        }
        state.finished = true;
        drop(state);
        self.publish(UpdateEvent::Terminal {
            outcome: outcome.clone(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wallet_update_agent_core::{ComponentId::Main, Outcome, Phase};

    use super::{EventSink, ProgressReporter, UpdateEvent};

    fn reporter() -> (ProgressReporter, flume::Receiver<UpdateEvent>) {
        let (tx, rx) = flume::unbounded();
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        (ProgressReporter::new(vec![sink]), rx)
    }

    #[test]
    fn phase_is_announced_once() {
        let (reporter, rx) = reporter();
        reporter.report_phase(Main, Phase::Downloading);
        reporter.report_phase(Main, Phase::Downloading);
        reporter.report(Main, Phase::Downloading, 0);
        let events: Vec<_> = rx.drain().collect();
        assert_eq!(
            vec![
                UpdateEvent::Phase {
                    component: Main,
                    phase: Phase::Downloading
                },
                UpdateEvent::Progress {
                    component: Main,
                    phase: Phase::Downloading,
                    percent: 0
                },
            ],
            events
        );
    }

    #[test]
    fn percent_only_moves_forward() {
        let (reporter, rx) = reporter();
        for percent in [10, 10, 9, 11, 11, 250] {
            reporter.report(Main, Phase::Flashing, percent);
        }
        let percents: Vec<_> = rx
            .drain()
            .filter_map(|event| match event {
                UpdateEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(vec![10, 11, 100], percents);
    }

    #[test]
    fn phase_change_resets_percent() {
        let (reporter, rx) = reporter();
        reporter.report(Main, Phase::Downloading, 100);
        reporter.report(Main, Phase::Flashing, 0);
        assert_eq!(4, rx.drain().count());
    }

    #[test]
    fn terminal_is_reported_exactly_once() {
        let (reporter, rx) = reporter();
        assert!(reporter.report_terminal(&Outcome::Cancelled));
        assert!(!reporter.report_terminal(&Outcome::Completed));
        reporter.report(Main, Phase::Flashing, 50);
        let events: Vec<_> = rx.drain().collect();
        assert_eq!(
            vec![UpdateEvent::Terminal {
                outcome: Outcome::Cancelled
            }],
            events
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(UpdateEvent::Progress {
            component: Main,
            phase: Phase::VerifyingDevice,
            percent: 42,
        })
        .unwrap();
        assert_eq!(
            serde_json::json!({
                "event": "progress",
                "component": "main",
                "phase": "verifying_device",
                "percent": 42
            }),
            json
        );
    }
}
