mod common;

use std::{io::Write as _, sync::Arc, time::Duration};

use wallet_update_agent::{
    SessionError, SessionRegistry, UpdateEvent, UpdateOptions, UpdateSession,
    download::{DownloadConfig, Downloader, Fetch},
    records::CandidateRecords as _,
};
use wallet_update_agent_core::{ComponentId, FailureReason, Outcome, Phase};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use common::{
    CountingTransports, FakeBleWallet, FakeFetch, FakeWallet, Harness, ble_device, candidate,
    component_candidate, device, main_image, radio_image, sha256_hex,
};

const IMAGE_URL: &str = "https://fw.example.com/main-1.3.0.bin";
const RADIO_URL: &str = "https://fw.example.com/radio-1.1.0.zip";

fn component_outcomes(events: &[UpdateEvent]) -> Vec<(ComponentId, Outcome)> {
    events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::ComponentDone { component, outcome } => {
                Some((*component, outcome.clone()))
            }
            _ => None,
        })
        .collect()
}

fn percents(events: &[UpdateEvent], of: Phase) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Progress { phase, percent, .. } if *phase == of => Some(*percent),
            _ => None,
        })
        .collect()
}

#[test]
fn downloads_flashes_and_verifies_main_firmware() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    let image = main_image(1000);
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/main-1.3.0.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(image.clone()))
            .expect(1)
            .mount(&server),
    );

    let downloader = Downloader::new(DownloadConfig {
        chunk_size: 256,
        progress_interval: Duration::ZERO,
        allow_http: true,
        ..DownloadConfig::default()
    })
    .unwrap();
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let harness = Harness::new(&wallet, Arc::new(downloader));
    let url = format!("{}/main-1.3.0.bin", server.uri());

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", &url)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    let events = session.events();
    let report = session.join();
    let events: Vec<_> = events.drain().collect();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(Some("1.3.0"), report.device.installed_version(ComponentId::Main));
    assert_eq!(image, wallet.state().received);
    assert!(harness.store.has(ComponentId::Main, "1.3.0", None));
    assert_eq!(
        Some(false),
        harness
            .records
            .get(ComponentId::Main)
            .unwrap()
            .map(|record| record.needs_upload)
    );

    let phases: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            UpdateEvent::Phase { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        vec![
            Phase::CheckingVersion,
            Phase::Downloading,
            Phase::Flashing,
            Phase::VerifyingDevice
        ],
        phases
    );
    for phase in [Phase::Downloading, Phase::Flashing] {
        let percents = percents(&events, phase);
        assert!(percents.windows(2).all(|w| w[0] < w[1]), "{phase}: {percents:?}");
        assert_eq!(Some(&100), percents.last(), "{phase}");
    }
    assert_eq!(
        Some(&UpdateEvent::Terminal {
            outcome: Outcome::Completed
        }),
        events.last()
    );
}

#[test]
fn device_needing_backup_is_left_alone() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::new(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut device = device("1.2.0");
    device.needs_backup = true;

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device,
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions { force: true },
        &harness.context,
    )
    .unwrap()
    .join();

    assert_eq!(Outcome::NeedsBackupFirst, report.outcome);
    assert_eq!(0, fetch.calls());
    assert_eq!(0, harness.transports.sessions());
}

#[test]
fn second_session_for_the_same_device_is_refused() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::blocking(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());
    let registry = SessionRegistry::new();
    let start = || {
        UpdateSession::start(
            &registry,
            device("1.2.0"),
            vec![candidate("1.3.0", IMAGE_URL)],
            UpdateOptions::default(),
            &harness.context,
        )
    };

    let first = start().unwrap();
    fetch.wait_started();
    match start() {
        Err(SessionError::SessionAlreadyActive(id)) => assert_eq!("wallet-usb-1", id.0),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second session started"),
    }
    assert!(!first.is_finished());

    assert!(first.cancel());
    assert_eq!(Outcome::Cancelled, first.join().outcome);
    assert!(!registry.is_active(&"wallet-usb-1".into()));
}

#[test]
fn cached_artifact_is_not_downloaded_again() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::new(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut writer = harness.store.reserve(ComponentId::Main).unwrap();
    writer.write_all(&main_image(1000)).unwrap();
    writer.commit("1.3.0", None).unwrap();

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(0, fetch.calls());
    assert_eq!(1, harness.transports.sessions());
}

#[test]
fn installed_version_is_already_latest() {
    let wallet = FakeWallet::new("1.3.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::new(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.3.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    assert_eq!(Outcome::AlreadyLatest, report.outcome);
    assert_eq!(0, fetch.calls());
    assert_eq!(0, harness.transports.sessions());
}

#[test]
fn cancelling_during_download_leaves_no_artifact() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::blocking(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    fetch.wait_started();
    assert!(session.cancel());
    assert!(!session.cancel());
    let report = session.join();

    assert_eq!(Outcome::Cancelled, report.outcome);
    assert!(!harness.store.has(ComponentId::Main, "1.3.0", None));
    assert!(!harness.store.artifact_path(ComponentId::Main).exists());
    assert_eq!(0, harness.transports.sessions());
    assert!(harness.records.get(ComponentId::Main).unwrap().is_none());
}

#[test]
fn link_lost_while_flashing_fails_the_session() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    wallet.state().drop_link_after = Some(600);
    let fetch: Arc<dyn Fetch> = Arc::new(FakeFetch::new(main_image(1000)));
    let harness = Harness::new(&wallet, fetch);

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    match report.outcome {
        Outcome::Failed(failure) => assert_eq!(FailureReason::LinkLost, failure.reason),
        other => panic!("unexpected outcome {other}"),
    }
    assert_eq!(Some("1.2.0"), report.device.installed_version(ComponentId::Main));
    assert_eq!("1.2.0", wallet.state().firmware_version);
    assert!(!wallet.state().connected);
    // the downloaded image stays cached for the next attempt
    assert!(harness.store.has(ComponentId::Main, "1.3.0", None));
}

#[test]
fn wallet_rebooting_into_unexpected_version_is_a_mismatch() {
    let wallet = FakeWallet::new("1.2.0", "1.2.5");
    let harness = Harness::new(&wallet, Arc::new(FakeFetch::new(main_image(1000))));

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    match report.outcome {
        Outcome::Failed(failure) => {
            assert_eq!(FailureReason::VerificationMismatch, failure.reason)
        }
        other => panic!("unexpected outcome {other}"),
    }
    assert_eq!(Some("1.2.0"), report.device.installed_version(ComponentId::Main));
    // the image itself was fine
    assert!(harness.store.has(ComponentId::Main, "1.3.0", None));
}

#[test]
fn cached_artifact_with_a_different_checksum_is_downloaded_again() {
    let stale = main_image(900);
    let fresh = main_image(1000);
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::new(fresh.clone()));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut writer = harness.store.reserve(ComponentId::Main).unwrap();
    writer.write_all(&stale).unwrap();
    writer.commit("1.3.0", Some(sha256_hex(&stale).as_str())).unwrap();

    let mut offered = candidate("1.3.0", IMAGE_URL);
    offered.checksum = Some(sha256_hex(&fresh));
    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![offered],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(1, fetch.calls());
    assert_eq!(fresh, wallet.state().received);
    assert!(
        harness
            .store
            .has(ComponentId::Main, "1.3.0", Some(sha256_hex(&fresh).as_str()))
    );
}

#[test]
fn candidate_recorded_as_downloaded_is_fetched_when_not_cached() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let fetch = Arc::new(FakeFetch::new(main_image(1000)));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut offered = candidate("1.3.0", IMAGE_URL);
    offered.needs_upload = false;

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![offered],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(1, fetch.calls());
}

#[test]
fn image_refused_by_the_wallet_is_discarded() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    wallet.state().reject_upload = true;
    let harness = Harness::new(&wallet, Arc::new(FakeFetch::new(main_image(1000))));

    let report = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap()
    .join();

    match report.outcome {
        Outcome::Failed(failure) => assert_eq!(FailureReason::CorruptArtifact, failure.reason),
        other => panic!("unexpected outcome {other}"),
    }
    assert_eq!("1.2.0", wallet.state().firmware_version);
    assert!(!harness.store.has(ComponentId::Main, "1.3.0", None));
    assert!(!harness.store.artifact_path(ComponentId::Main).exists());
}

#[test]
fn main_firmware_is_flashed_before_radio() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    {
        let mut state = wallet.state();
        state.radio_version = Some("1.0.0".into());
        state.radio_installs = "1.1.0".into();
    }
    let radio = radio_image(700);
    let fetch = Arc::new(FakeFetch::new(main_image(1000)).with("radio-1.1.0.zip", radio.clone()));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut device = device("1.2.0");
    device.installed.insert(ComponentId::Radio, "1.0.0".into());

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        device,
        vec![
            component_candidate(ComponentId::Radio, "1.1.0", RADIO_URL),
            candidate("1.3.0", IMAGE_URL),
        ],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    let events = session.events();
    let report = session.join();
    let events: Vec<_> = events.drain().collect();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(2, fetch.calls());
    assert_eq!(
        vec![ComponentId::Main, ComponentId::Radio],
        wallet.state().installed
    );
    // the radio image went out last
    assert_eq!(radio, wallet.state().received);
    assert_eq!(
        vec![
            (ComponentId::Main, Outcome::Completed),
            (ComponentId::Radio, Outcome::Completed)
        ],
        component_outcomes(&events)
    );
    assert_eq!(Some("1.3.0"), report.device.installed_version(ComponentId::Main));
    assert_eq!(Some("1.1.0"), report.device.installed_version(ComponentId::Radio));
    assert_eq!(1, harness.transports.sessions());
}

#[test]
fn current_main_with_newer_radio_completes() {
    let wallet = FakeWallet::new("1.3.0", "1.3.0");
    {
        let mut state = wallet.state();
        state.radio_version = Some("1.0.0".into());
        state.radio_installs = "1.1.0".into();
    }
    let fetch = Arc::new(FakeFetch::new(radio_image(700)));
    let harness = Harness::new(&wallet, fetch.clone());
    let mut device = device("1.3.0");
    device.installed.insert(ComponentId::Radio, "1.0.0".into());

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        device,
        vec![
            component_candidate(ComponentId::Radio, "1.1.0", RADIO_URL),
            candidate("1.3.0", IMAGE_URL),
        ],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    let events = session.events();
    let report = session.join();
    let events: Vec<_> = events.drain().collect();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(1, fetch.calls());
    assert_eq!(vec![ComponentId::Radio], wallet.state().installed);
    assert_eq!(
        vec![
            (ComponentId::Main, Outcome::AlreadyLatest),
            (ComponentId::Radio, Outcome::Completed)
        ],
        component_outcomes(&events)
    );
}

#[test]
fn ble_wallet_is_updated_object_by_object() {
    let image = main_image(1000);
    let wallet = FakeBleWallet::new("1.2.0", "1.3.0", 400);
    let harness = Harness::with_transports(
        CountingTransports::ble(&wallet),
        Arc::new(FakeFetch::new(image.clone())),
    );

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        ble_device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    let events = session.events();
    let report = session.join();
    let events: Vec<_> = events.drain().collect();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(Some("1.3.0"), report.device.installed_version(ComponentId::Main));
    let state = wallet.state();
    assert_eq!(image, state.stored);
    let count = |name: &str| state.commands.iter().filter(|&&c| c == name).count();
    assert_eq!(1, count("dfu_start"));
    assert_eq!(3, count("dfu_create"));
    assert_eq!(3, count("dfu_execute"));
    assert_eq!(0, count("reboot_to_bootloader"));
    assert!(!state.connected);
    let flashing = percents(&events, Phase::Flashing);
    assert!(flashing.windows(2).all(|w| w[0] < w[1]), "{flashing:?}");
    assert_eq!(Some(&100), flashing.last());
}

#[test]
fn cancelling_during_flashing_stops_the_upload() {
    let wallet = FakeWallet::new("1.2.0", "1.3.0");
    let (reached, release) = wallet.pause_first_upload();
    let harness = Harness::new(&wallet, Arc::new(FakeFetch::new(main_image(1000))));

    let session = UpdateSession::start(
        &SessionRegistry::new(),
        device("1.2.0"),
        vec![candidate("1.3.0", IMAGE_URL)],
        UpdateOptions::default(),
        &harness.context,
    )
    .unwrap();
    reached.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(session.cancel());
    release.send(()).unwrap();
    let report = session.join();

    assert_eq!(Outcome::Cancelled, report.outcome);
    let state = wallet.state();
    assert_eq!("1.2.0", state.firmware_version);
    assert_eq!(1, state.commands.iter().filter(|&&c| c == "firmware_upload").count());
    assert!(!state.connected);
    assert_eq!(Some("1.2.0"), report.device.installed_version(ComponentId::Main));
}
