use std::time::Duration;

use tracing::{info, warn};
use wallet_update_agent_core::TransportKind;

use super::{Command, CommandExecutor, Link, Response, TransportError, TransportSession};

/// Payload of one DFU data packet on a 247 byte ATT MTU.
pub const BLE_MAX_CHUNK_LEN: usize = 244;
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Bluetooth LE session. Connecting is retried since advertisements are easily missed.
pub struct BleSession {
    link: Link,
    retry_delay: Duration,
}

impl BleSession {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self {
            link: Link::new(executor),
            retry_delay: CONNECT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl TransportSession for BleSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.link.open(address) {
                Ok(()) => {
                    info!("connected to `{address}` over ble");
                    return Ok(());
                }
                Err(reason) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        "ble connect attempt {attempt}/{CONNECT_ATTEMPTS} to `{address}` \
                         failed: {reason}"
                    );
                    attempt += 1;
                    std::thread::sleep(self.retry_delay);
                }
                Err(reason) => {
                    return Err(TransportError::ConnectFailed {
                        address: address.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    fn send_command(&mut self, command: &Command) -> Result<Response, TransportError> {
        self.link.round_trip(command)
    }

    fn disconnect(&mut self) {
        self.link.close();
    }

    fn is_alive(&self) -> bool {
        self.link.is_open()
    }

    fn max_chunk_len(&self) -> usize {
        BLE_MAX_CHUNK_LEN
    }
}
