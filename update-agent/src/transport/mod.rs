//! Command channels to a physical device.
//!
//! A [`TransportSession`] wraps the driver supplied [`CommandExecutor`] of one transport
//! kind and turns driver failures into [`TransportError`]s. Sessions are opened through a
//! [`TransportFactory`], usually [`Transports`].
use tracing::{debug, info, warn};
use wallet_update_agent_core::TransportKind;

pub mod ble;
pub mod command;
pub mod nfc;
pub mod usb;

pub use self::{
    ble::BleSession,
    command::{Command, Features, RejectCode, Response},
    nfc::NfcSession,
    usb::UsbSession,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to a device")]
    NotConnected,
    #[error("failed connecting to `{address}`: {reason}")]
    ConnectFailed { address: String, reason: LinkError },
    #[error("link lost during `{command}`: {reason}")]
    LinkLost {
        command: &'static str,
        reason: LinkError,
    },
    #[error("device rejected `{command}` with {code:?}: {message}")]
    Rejected {
        command: &'static str,
        code: RejectCode,
        message: String,
    },
    #[error("no driver registered for transport `{0}`")]
    Unavailable(TransportKind),
}

impl TransportError {
    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::LinkLost { .. } | Self::NotConnected)
    }
}

/// Failures reported by a driver.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link dropped")]
    Disconnected,
    #[error("no answer in time")]
    Timeout,
    #[error("driver error: {0}")]
    Driver(String),
}

/// Driver side request/response interface of one physical link.
pub trait CommandExecutor: Send {
    fn open(&mut self, address: &str) -> Result<(), LinkError>;
    fn call(&mut self, command: &Command) -> Result<Response, LinkError>;
    fn close(&mut self);
}

/// An open channel to one device.
pub trait TransportSession: Send {
    fn kind(&self) -> TransportKind;

    fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    /// Blocking round-trip. A device `Failure` answer becomes [`TransportError::Rejected`].
    fn send_command(&mut self, command: &Command) -> Result<Response, TransportError>;

    /// Idempotent.
    fn disconnect(&mut self);

    fn is_alive(&self) -> bool;

    /// Largest payload a single write command may carry.
    fn max_chunk_len(&self) -> usize;
}

pub trait TransportFactory: Send + Sync {
    fn open_session(
        &self,
        kind: TransportKind,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// Shared plumbing of the concrete sessions.
struct Link {
    executor: Box<dyn CommandExecutor>,
    address: Option<String>,
}

impl Link {
    fn new(executor: Box<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            address: None,
        }
    }

    fn open(&mut self, address: &str) -> Result<(), LinkError> {
        self.executor.open(address)?;
        self.address = Some(address.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.address.is_some()
    }

    /// Issues `command`, closing the link on any driver failure.
    fn round_trip(&mut self, command: &Command) -> Result<Response, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        debug!("sending `{}`", command.name());
        match self.executor.call(command) {
            Ok(Response::Failure { code, message }) => {
                warn!("device rejected `{}`: {code:?} {message}", command.name());
                Err(TransportError::Rejected {
                    command: command.name(),
                    code,
                    message,
                })
            }
            Ok(response) => Ok(response),
            Err(reason) => {
                warn!("link lost during `{}`: {reason}", command.name());
                self.close();
                Err(TransportError::LinkLost {
                    command: command.name(),
                    reason,
                })
            }
        }
    }

    fn close(&mut self) {
        if let Some(address) = self.address.take() {
            info!("disconnecting from `{address}`");
            self.executor.close();
        }
    }
}

pub type ExecutorConstructor =
    Box<dyn Fn() -> Result<Box<dyn CommandExecutor>, LinkError> + Send + Sync>;

/// Creates sessions from the driver constructors registered per transport kind.
#[derive(Default)]
pub struct Transports {
    ble: Option<ExecutorConstructor>,
    nfc: Option<ExecutorConstructor>,
    usb: Option<ExecutorConstructor>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ble<F>(mut self, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn CommandExecutor>, LinkError> + Send + Sync + 'static,
    {
        self.ble = Some(Box::new(constructor));
        self
    }

    pub fn with_nfc<F>(mut self, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn CommandExecutor>, LinkError> + Send + Sync + 'static,
    {
        self.nfc = Some(Box::new(constructor));
        self
    }

    pub fn with_usb<F>(mut self, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn CommandExecutor>, LinkError> + Send + Sync + 'static,
    {
        self.usb = Some(Box::new(constructor));
        self
    }
}

impl TransportFactory for Transports {
    fn open_session(
        &self,
        kind: TransportKind,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let constructor = match kind {
            TransportKind::Ble => &self.ble,
            TransportKind::Nfc => &self.nfc,
            TransportKind::Usb => &self.usb,
        }
        .as_ref()
        .ok_or(TransportError::Unavailable(kind))?;
        let executor = constructor().map_err(|reason| TransportError::ConnectFailed {
            address: format!("{kind} driver"),
            reason,
        })?;
        let session: Box<dyn TransportSession> = match kind {
            TransportKind::Ble => Box::new(BleSession::new(executor)),
            TransportKind::Nfc => Box::new(NfcSession::new(executor)),
            TransportKind::Usb => Box::new(UsbSession::new(executor)),
        };
        Ok(session)
    }
}

/// Owns a session for the duration of a flash and disconnects it when dropped.
pub struct SessionGuard(Box<dyn TransportSession>);

impl SessionGuard {
    pub fn new(session: Box<dyn TransportSession>) -> Self {
        Self(session)
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = dyn TransportSession;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::ops::DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}
