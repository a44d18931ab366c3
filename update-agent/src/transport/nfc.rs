use tracing::info;
use wallet_update_agent_core::TransportKind;

use super::{
    Command, CommandExecutor, Link, Response, TransportError, TransportSession,
};

/// Largest APDU payload accepted by the device's NFC interface.
pub const NFC_MAX_CHUNK_LEN: usize = 1024;

/// NFC session. The tag must stay on the reader; it is connected exactly once per attempt
/// and a moved tag surfaces as a lost link.
pub struct NfcSession {
    link: Link,
}

impl NfcSession {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self {
            link: Link::new(executor),
        }
    }
}

impl TransportSession for NfcSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Nfc
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        self.link
            .open(address)
            .map_err(|reason| TransportError::ConnectFailed {
                address: address.to_string(),
                reason,
            })?;
        info!("connected to tag `{address}`");
        Ok(())
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
        NFC_MAX_CHUNK_LEN
    }
}
