use tracing::info;
use wallet_update_agent_core::TransportKind;

use super::{
    Command, CommandExecutor, Link, Response, TransportError, TransportSession,
};

pub const USB_MAX_CHUNK_LEN: usize = 64 * 1024;

pub struct UsbSession {
    link: Link,
}

impl UsbSession {
    pub fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self {
            link: Link::new(executor),
        }
    }
}

impl TransportSession for UsbSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if self.link.is_open() {
            self.link.close();
        }
        self.link
            .open(address)
            .map_err(|reason| TransportError::ConnectFailed {
                address: address.to_string(),
                reason,
            })?;
        info!("opened usb device `{address}`");
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
        USB_MAX_CHUNK_LEN
    }
}
