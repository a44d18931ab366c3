#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use wallet_update_agent::{
    UpdateContext,
    artifact::ArtifactStore,
    download::{DownloadError, Fetch, OnProgress},
    records::MemoryRecords,
    transport::{
        Command, CommandExecutor, Features, LinkError, RejectCode, Response,
        TransportError, TransportFactory, TransportSession, Transports,
    },
};
use wallet_update_agent_core::{
    CancellationController, ComponentId, Device, FirmwareCandidate, LocalOrRemote,
    TransportKind,
};

pub const DEVICE_ADDRESS: &str = "usb:1-1.4";
pub const BLE_ADDRESS: &str = "C4:7E:21:0A:5B:90";
/// Bytes the fake wallet pulls per `FirmwareRequest`.
pub const REQUEST_LEN: u32 = 300;

/// A main firmware image of `len` bytes as the store accepts it.
pub fn main_image(len: usize) -> Vec<u8> {
    let mut image = b"TRZF".to_vec();
    image.extend((4..len).map(|i| (i % 251) as u8));
    image
}

/// A radio firmware package of `len` bytes.
pub fn radio_image(len: usize) -> Vec<u8> {
    let mut image = b"PK\x03\x04".to_vec();
    image.extend((4..len).map(|i| (i % 241) as u8));
    image
}

pub fn sha256_hex(image: &[u8]) -> String {
    use sha2::{Digest as _, Sha256};
    hex::encode(Sha256::digest(image))
}

pub fn device(main: &str) -> Device {
    Device {
        id: "wallet-usb-1".into(),
        address: DEVICE_ADDRESS.into(),
        transport: TransportKind::Usb,
        installed: BTreeMap::from([(ComponentId::Main, main.to_string())]),
        initialized: true,
        needs_backup: false,
        bootloader_mode: false,
    }
}

/// A wallet reachable over Bluetooth LE.
pub fn ble_device(main: &str) -> Device {
    Device {
        id: "wallet-ble-1".into(),
        address: BLE_ADDRESS.into(),
        transport: TransportKind::Ble,
        ..device(main)
    }
}

pub fn candidate(version: &str, url: &str) -> FirmwareCandidate {
    component_candidate(ComponentId::Main, version, url)
}

pub fn component_candidate(
    component: ComponentId,
    version: &str,
    url: &str,
) -> FirmwareCandidate {
    FirmwareCandidate {
        component,
        version: version.into(),
        source: LocalOrRemote::parse(url).unwrap(),
        checksum: None,
        changelog: BTreeMap::new(),
        needs_upload: true,
    }
}

/// Holds the first `FirmwareUpload` until the test releases it.
#[derive(Debug)]
pub struct UploadGate {
    pub reached: flume::Sender<()>,
    pub release: flume::Receiver<()>,
}

#[derive(Debug)]
pub struct WalletState {
    pub firmware_version: String,
    pub radio_version: Option<String>,
    pub bootloader_mode: bool,
    /// Version the wallet boots into once a main upload completes.
    pub installs: String,
    /// Radio version reported once a radio upload completes.
    pub radio_installs: String,
    /// Drops the link once this many bytes were received.
    pub drop_link_after: Option<usize>,
    /// Refuses every upload as an invalid image.
    pub reject_upload: bool,
    pub upload_gate: Option<UploadGate>,
    pub connected: bool,
    pub erasing: ComponentId,
    pub expected: u32,
    pub received: Vec<u8>,
    /// Components in the order their uploads completed.
    pub installed: Vec<ComponentId>,
    pub commands: Vec<&'static str>,
}

impl WalletState {
    fn next_request(&self) -> Response {
        let offset = self.received.len() as u32;
        if offset >= self.expected {
            return Response::Success;
        }
        Response::FirmwareRequest {
            offset,
            length: REQUEST_LEN.min(self.expected - offset),
        }
    }

    fn features(&self) -> Features {
        Features {
            firmware_version: Some(self.firmware_version.clone()),
            radio_version: self.radio_version.clone(),
            bootloader_version: Some("1.8.1".into()),
            bootloader_mode: self.bootloader_mode,
            initialized: true,
            ..Features::default()
        }
    }
}

/// Wired wallet behind the real usb session. Shares its state with the test.
#[derive(Clone)]
pub struct FakeWallet(pub Arc<Mutex<WalletState>>);

impl FakeWallet {
    pub fn new(firmware_version: &str, installs: &str) -> Self {
        Self(Arc::new(Mutex::new(WalletState {
            firmware_version: firmware_version.into(),
            radio_version: None,
            bootloader_mode: false,
            installs: installs.into(),
            radio_installs: String::new(),
            drop_link_after: None,
            reject_upload: false,
            upload_gate: None,
            connected: false,
            erasing: ComponentId::Main,
            expected: 0,
            received: Vec::new(),
            installed: Vec::new(),
            commands: Vec::new(),
        })))
    }

    /// Makes the first upload wait for the returned release sender. The returned
    /// receiver fires once that upload arrived.
    pub fn pause_first_upload(&self) -> (flume::Receiver<()>, flume::Sender<()>) {
        let (reached, reached_rx) = flume::bounded(1);
        let (release_tx, release) = flume::bounded(1);
        self.state().upload_gate = Some(UploadGate { reached, release });
        (reached_rx, release_tx)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, WalletState> {
        self.0.lock().unwrap()
    }
}

impl CommandExecutor for FakeWallet {
    fn open(&mut self, address: &str) -> Result<(), LinkError> {
        assert_eq!(DEVICE_ADDRESS, address);
        self.state().connected = true;
        Ok(())
    }

    fn call(&mut self, command: &Command) -> Result<Response, LinkError> {
        if matches!(command, Command::FirmwareUpload { .. }) {
            let gate = self.state().upload_gate.take();
            if let Some(gate) = gate {
                gate.reached.send(()).unwrap();
                gate.release
                    .recv_timeout(Duration::from_secs(10))
                    .expect("upload never released");
            }
        }
        let mut state = self.state();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        state.commands.push(command.name());
        match command {
            Command::GetFeatures => Ok(Response::Features(state.features())),
            Command::RebootToBootloader => {
                state.bootloader_mode = true;
                state.connected = false;
                Err(LinkError::Disconnected)
            }
            Command::FirmwareErase { component, length } => {
                assert!(state.bootloader_mode, "erase outside bootloader");
                state.erasing = *component;
                state.expected = *length;
                state.received.clear();
                Ok(state.next_request())
            }
            Command::FirmwareUpload { data } => {
                if state
                    .drop_link_after
                    .is_some_and(|limit| state.received.len() >= limit)
                {
                    state.connected = false;
                    return Err(LinkError::Disconnected);
                }
                if state.reject_upload {
                    return Ok(Response::Failure {
                        code: RejectCode::InvalidImage,
                        message: "image signature invalid".into(),
                    });
                }
                state.received.extend_from_slice(data);
                let response = state.next_request();
                if response == Response::Success {
                    match state.erasing {
                        ComponentId::Main => state.firmware_version = state.installs.clone(),
                        ComponentId::Radio => {
                            state.radio_version = Some(state.radio_installs.clone());
                        }
                    }
                    let done = state.erasing;
                    state.installed.push(done);
                    state.bootloader_mode = false;
                }
                Ok(response)
            }
            other => Ok(Response::Failure {
                code: RejectCode::Other(99),
                message: format!("unsupported `{}`", other.name()),
            }),
        }
    }

    fn close(&mut self) {
        self.state().connected = false;
    }
}

#[derive(Debug)]
pub struct DfuState {
    pub firmware_version: String,
    /// Version the wallet runs once the whole image was executed.
    pub installs: String,
    pub max_size: u32,
    pub connected: bool,
    pub size: u32,
    /// Executed objects.
    pub stored: Vec<u8>,
    /// Written but not yet executed.
    pub object: Vec<u8>,
    pub commands: Vec<&'static str>,
}

impl DfuState {
    fn received(&self) -> Vec<u8> {
        [self.stored.as_slice(), self.object.as_slice()].concat()
    }
}

/// Wallet speaking object based DFU behind the real ble session.
#[derive(Clone)]
pub struct FakeBleWallet(pub Arc<Mutex<DfuState>>);

impl FakeBleWallet {
    pub fn new(firmware_version: &str, installs: &str, max_size: u32) -> Self {
        Self(Arc::new(Mutex::new(DfuState {
            firmware_version: firmware_version.into(),
            installs: installs.into(),
            max_size,
            connected: false,
            size: 0,
            stored: Vec::new(),
            object: Vec::new(),
            commands: Vec::new(),
        })))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, DfuState> {
        self.0.lock().unwrap()
    }
}

impl CommandExecutor for FakeBleWallet {
    fn open(&mut self, address: &str) -> Result<(), LinkError> {
        assert_eq!(BLE_ADDRESS, address);
        self.state().connected = true;
        Ok(())
    }

    fn call(&mut self, command: &Command) -> Result<Response, LinkError> {
        let mut state = self.state();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        state.commands.push(command.name());
        let response = match command {
            Command::GetFeatures => Response::Features(Features {
                firmware_version: Some(state.firmware_version.clone()),
                initialized: true,
                ..Features::default()
            }),
            Command::DfuStart { size, .. } => {
                state.size = *size;
                state.stored.clear();
                state.object.clear();
                Response::Success
            }
            Command::DfuSelect => {
                let received = state.received();
                Response::DfuObjectInfo {
                    max_size: state.max_size,
                    offset: received.len() as u32,
                    crc: crc32fast::hash(&received),
                }
            }
            Command::DfuCreate { size } => {
                assert!(*size <= state.max_size, "object of {size} bytes too large");
                state.object.clear();
                Response::Success
            }
            Command::DfuWrite { data } => {
                assert!(data.len() <= 244, "packet of {} bytes", data.len());
                state.object.extend_from_slice(data);
                Response::Success
            }
            Command::DfuChecksum => {
                let received = state.received();
                Response::DfuChecksum {
                    offset: received.len() as u32,
                    crc: crc32fast::hash(&received),
                }
            }
            Command::DfuExecute => {
                let object = std::mem::take(&mut state.object);
                state.stored.extend_from_slice(&object);
                if state.stored.len() as u32 == state.size {
                    state.firmware_version = state.installs.clone();
                }
                Response::Success
            }
            other => Response::Failure {
                code: RejectCode::Other(99),
                message: format!("unsupported `{}`", other.name()),
            },
        };
        Ok(response)
    }

    fn close(&mut self) {
        self.state().connected = false;
    }
}

/// Counts opened sessions of the wrapped factory.
pub struct CountingTransports {
    inner: Transports,
    pub sessions: AtomicUsize,
}

impl CountingTransports {
    pub fn usb(wallet: &FakeWallet) -> Self {
        let wallet = wallet.clone();
        Self {
            inner: Transports::new().with_usb(move || {
                let executor: Box<dyn CommandExecutor> = Box::new(wallet.clone());
                Ok(executor)
            }),
            sessions: AtomicUsize::new(0),
        }
    }

    pub fn ble(wallet: &FakeBleWallet) -> Self {
        let wallet = wallet.clone();
        Self {
            inner: Transports::new().with_ble(move || {
                let executor: Box<dyn CommandExecutor> = Box::new(wallet.clone());
                Ok(executor)
            }),
            sessions: AtomicUsize::new(0),
        }
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl TransportFactory for CountingTransports {
    fn open_session(
        &self,
        kind: TransportKind,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        self.inner.open_session(kind)
    }
}

/// Serves a fixed image, or one per file name. Optionally blocks after the first half
/// until cancelled.
pub struct FakeFetch {
    image: Vec<u8>,
    by_name: Vec<(String, Vec<u8>)>,
    block_until_cancelled: bool,
    calls: AtomicUsize,
    started: flume::Sender<()>,
    started_rx: flume::Receiver<()>,
}

impl FakeFetch {
    pub fn new(image: Vec<u8>) -> Self {
        let (started, started_rx) = flume::unbounded();
        Self {
            image,
            by_name: Vec::new(),
            block_until_cancelled: false,
            calls: AtomicUsize::new(0),
            started,
            started_rx,
        }
    }

    pub fn blocking(image: Vec<u8>) -> Self {
        Self {
            block_until_cancelled: true,
            ..Self::new(image)
        }
    }

    /// Serves `image` for sources ending in `name`.
    pub fn with(mut self, name: &str, image: Vec<u8>) -> Self {
        self.by_name.push((name.to_string(), image));
        self
    }

    fn image_for(&self, source: &LocalOrRemote) -> &[u8] {
        let source = source.to_string();
        self.by_name
            .iter()
            .find(|(name, _)| source.ends_with(name.as_str()))
            .map_or(&self.image, |(_, image)| image)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Waits until a fetch wrote its first half.
    pub fn wait_started(&self) {
        self.started_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("fetch never started");
    }
}

impl Fetch for FakeFetch {
    fn fetch(
        &self,
        source: &LocalOrRemote,
        target: &mut dyn Write,
        cancel: &CancellationController,
        on_progress: &mut OnProgress<'_>,
    ) -> Result<u64, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let image = self.image_for(source);
        let total = image.len() as u64;
        let (head, tail) = image.split_at(image.len() / 2);
        target.write_all(head).map_err(DownloadError::Write)?;
        on_progress(head.len() as u64, Some(total));
        let _ = self.started.send(());
        if self.block_until_cancelled {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled(source.to_string()));
        }
        target.write_all(tail).map_err(DownloadError::Write)?;
        on_progress(total, Some(total));
        Ok(total)
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<ArtifactStore>,
    pub transports: Arc<CountingTransports>,
    pub records: Arc<MemoryRecords>,
    pub context: UpdateContext,
}

impl Harness {
    pub fn new(wallet: &FakeWallet, fetcher: Arc<dyn Fetch>) -> Self {
        Self::with_transports(CountingTransports::usb(wallet), fetcher)
    }

    pub fn with_transports(transports: CountingTransports, fetcher: Arc<dyn Fetch>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path().join("downloads")).unwrap());
        let transports = Arc::new(transports);
        let records = Arc::new(MemoryRecords::default());
        let context = UpdateContext {
            store: Arc::clone(&store),
            fetcher,
            transports: transports.clone(),
            records: records.clone(),
            sinks: Vec::new(),
        };
        Self {
            dir,
            store,
            transports,
            records,
            context,
        }
    }
}
