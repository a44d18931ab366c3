//! Command sequences that write a firmware image onto a device.
use tracing::{info, warn};
use wallet_update_agent_core::{
    CancellationController, ComponentId, TransportKind,
    telemetry::count_component,
};

use crate::transport::{Command, Features, Response, TransportError, TransportSession};

pub mod dfu;
pub mod direct;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("flashing cancelled")]
    Cancelled,
    #[error("image cannot be flashed: {0}")]
    CorruptImage(String),
    #[error("image of {0} bytes is too large to transfer")]
    ImageTooLarge(usize),
    #[error("device did not enter bootloader mode")]
    BootloaderUnavailable,
    #[error(
        "transfer checksum mismatch at offset {offset}: device reported {device_crc:#010x} \
         at {device_offset}, expected {local_crc:#010x}"
    )]
    ChecksumMismatch {
        offset: u32,
        device_offset: u32,
        device_crc: u32,
        local_crc: u32,
    },
    #[error("unexpected answer to `{command}`: {response}")]
    UnexpectedResponse {
        command: &'static str,
        response: String,
    },
}

impl FlashError {
    fn unexpected(command: &Command, response: &Response) -> Self {
        Self::UnexpectedResponse {
            command: command.name(),
            response: format!("{response:?}"),
        }
    }
}

/// What a flash run needs besides the session and the image.
pub struct FlashContext<'a> {
    pub component: ComponentId,
    /// Address to reconnect to when the device reboots mid flash.
    pub address: &'a str,
    pub cancel: &'a CancellationController,
    /// Receives the percentage of the image the device has accepted.
    pub on_progress: &'a mut dyn FnMut(u8),
}

impl FlashContext<'_> {
    fn check_cancel(&self) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            info!("flashing of {} cancelled", self.component);
            return Err(FlashError::Cancelled);
        }
        Ok(())
    }

    fn report(&mut self, done: u64, total: u64) {
        (self.on_progress)(crate::util::percent(done, total));
    }

    /// Cancellation is checked before every command; commands in flight are never aborted.
    fn send(
        &self,
        session: &mut dyn TransportSession,
        command: &Command,
    ) -> Result<Response, FlashError> {
        self.check_cancel()?;
        Ok(session.send_command(command)?)
    }
}

pub trait Flash {
    fn flash(
        &self,
        session: &mut dyn TransportSession,
        image: &[u8],
        ctx: &mut FlashContext<'_>,
    ) -> Result<(), FlashError>;
}

/// The flashing protocol spoken over a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashMethod {
    /// Object based device firmware update, used over Bluetooth LE.
    Dfu,
    /// Device driven erase and upload, used over the wired transports.
    DirectWrite,
}

impl FlashMethod {
    /// Picks the protocol by transport alone. Every component, main firmware included,
    /// goes through DFU over Bluetooth LE.
    pub fn for_transport(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Ble => FlashMethod::Dfu,
            TransportKind::Nfc | TransportKind::Usb => FlashMethod::DirectWrite,
        }
    }
}

impl Flash for FlashMethod {
    fn flash(
        &self,
        session: &mut dyn TransportSession,
        image: &[u8],
        ctx: &mut FlashContext<'_>,
    ) -> Result<(), FlashError> {
        let component = ctx.component;
        let transport = session.kind();
        info!(
            "flashing {} bytes of {component} over {transport} using {self:?}",
            image.len()
        );
        count_component(component, transport, "started");
        let result = match self {
            FlashMethod::Dfu => dfu::Dfu.flash(session, image, ctx),
            FlashMethod::DirectWrite => direct::DirectWrite.flash(session, image, ctx),
        };
        match &result {
            Ok(()) => count_component(component, transport, "flashed"),
            Err(FlashError::Cancelled) => count_component(component, transport, "cancelled"),
            Err(e) => {
                warn!("flashing {component} failed: {e}");
                count_component(component, transport, "write_error");
            }
        }
        result
    }
}

/// Queries the device state.
pub fn query_features(session: &mut dyn TransportSession) -> Result<Features, FlashError> {
    let command = Command::GetFeatures;
    match session.send_command(&command)? {
        Response::Features(features) => Ok(features),
        other => Err(FlashError::unexpected(&command, &other)),
    }
}

fn expect_success(command: &Command, response: Response) -> Result<(), FlashError> {
    match response {
        Response::Success => Ok(()),
        other => Err(FlashError::unexpected(command, &other)),
    }
}

fn image_len(image: &[u8]) -> Result<u32, FlashError> {
    u32::try_from(image.len()).map_err(|_| FlashError::ImageTooLarge(image.len()))
}
