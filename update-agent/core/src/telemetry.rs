//! Update counters reported over statsd.
use dogstatsd::{Client, DogstatsdResult, Options};
use once_cell::sync::Lazy;

use crate::device::{ComponentId, TransportKind};

/// `None` if no statsd socket could be set up. Counters are skipped then.
pub static DATADOG: Lazy<Option<Client>> = Lazy::new(init_datadog_client);

pub const COMPONENT_COUNT_METRIC: &str = "wallet.update.count.component";

fn init_datadog_client() -> Option<Client> {
    match Client::new(Options::default()) {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::error!("failed to initialize datadog telemetry client: {err:?}");
            None
        }
    }
}

/// Counts a flashing milestone of `component`, tagged with the transport in use.
pub fn count_component(component: ComponentId, transport: TransportKind, status: &str) {
    let Some(client) = DATADOG.as_ref() else {
        return;
    };
    client
        .incr(
            COMPONENT_COUNT_METRIC,
            [
                format!("component:{component}"),
                format!("transport:{transport}"),
                format!("status:{status}"),
            ],
        )
        .or_log();
}

/// A trait for logging errors instead of propagating the error with `?`.
pub trait LogOnError {
    /// Logs an error message to the default logger at the `Error` level.
    fn or_log(&self);
}

impl LogOnError for DogstatsdResult {
    fn or_log(&self) {
        if let Err(e) = self {
            tracing::error!("Datadog reporting failed with error: {e:#?}");
        }
    }
}
