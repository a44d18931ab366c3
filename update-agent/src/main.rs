//! `wallet-update-agent` prepares firmware updates for paired hardware wallets.
//!
//! Flashing needs a device driver and is driven through the library by the wallet
//! service. This binary covers the parts that don't:
//!
//! 1. `compare` two firmware versions;
//! 2. `check` which candidates a device would install;
//! 3. `fetch` candidates into the artifact store ahead of a session, so that the update
//!    itself does not need the network.
use std::{borrow::Cow, fs::File, path::Path};

use clap::Parser as _;
use eyre::{WrapErr as _, bail};
use tracing::{error, info, warn};
use wallet_update_agent::{
    Args, Settings,
    artifact::ArtifactStore,
    decide,
    download::{Downloader, Fetch as _},
    records::{CandidateRecords as _, JsonFileRecords, reconcile},
    settings::Command,
};
use wallet_update_agent_core::{
    CancellationController, CandidateRecord, Device, FirmwareCandidate,
    candidate::sort_candidates, version::compare,
};

mod logging;
mod update_agent_result;
use update_agent_result::UpdateAgentResult;

const CFG_DEFAULT_PATH: &str = "/etc/wallet_update_agent.conf";
const ENV_VAR_PREFIX: &str = "WALLET_UPDATE_AGENT_";
const CFG_ENV_VAR: &str = const_format::concatcp!(ENV_VAR_PREFIX, "CONFIG");
const SYSLOG_IDENTIFIER: &str = "wallet-update-agent";

fn main() -> UpdateAgentResult {
    logging::init(SYSLOG_IDENTIFIER);

    let args = Args::parse();

    match run(&args) {
        Ok(()) => UpdateAgentResult::Success,
        Err(err) => {
            error!("{err:?}");
            err.into()
        }
    }
}

fn get_config_source(args: &Args) -> Cow<'_, Path> {
    if let Some(config) = &args.config {
        info!("using config provided by command line argument: `{config}`");
        Cow::Borrowed(config.as_ref())
    } else if let Some(config) = figment::providers::Env::var(CFG_ENV_VAR) {
        info!("using config set in environment variable `{CFG_ENV_VAR}={config}`");
        Cow::Owned(std::path::PathBuf::from(config))
    } else {
        info!("using default config at `{CFG_DEFAULT_PATH}`");
        Cow::Borrowed(CFG_DEFAULT_PATH.as_ref())
    }
}

fn run(args: &Args) -> eyre::Result<()> {
    let config = get_config_source(args);
    let settings = Settings::get(args, config, ENV_VAR_PREFIX)
        .wrap_err("failed reading settings")?;
    debug_settings(&settings);

    match &args.command {
        Some(Command::Compare { a, b }) => {
            let ordering = match compare(a, b)? {
                std::cmp::Ordering::Less => "less",
                std::cmp::Ordering::Equal => "equal",
                std::cmp::Ordering::Greater => "greater",
            };
            println!("{ordering}");
            Ok(())
        }
        Some(Command::Check { device, candidates }) => {
            let device: Device = read_json(device)?;
            let candidates = load_candidates(candidates, &settings)?;
            check(&device, &candidates, &settings)
        }
        Some(Command::Fetch { candidates }) => {
            let candidates = load_candidates(candidates, &settings)?;
            fetch(&candidates, &settings)
        }
        None => bail!("no command given, see `--help`"),
    }
}

fn debug_settings(settings: &Settings) {
    info!(
        "downloads: `{}`, records: `{}`, chunk size: {}, stall timeout: {:?}",
        settings.downloads.display(),
        settings.records.display(),
        settings.chunk_size,
        settings.stall_timeout,
    );
    if settings.allow_http {
        warn!("plain http downloads are permitted");
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> eyre::Result<T> {
    let file = File::open(path)
        .wrap_err_with(|| format!("failed opening `{}`", path.display()))?;
    wallet_update_agent::json::deserialize(file)
        .wrap_err_with(|| format!("failed parsing `{}`", path.display()))
}

fn load_candidates(path: &Path, settings: &Settings) -> eyre::Result<Vec<FirmwareCandidate>> {
    let mut candidates = sort_candidates(read_json(path)?)?;
    let records = JsonFileRecords::new(&settings.records);
    reconcile(&records, &mut candidates).wrap_err("failed reading candidate records")?;
    Ok(candidates)
}

fn check(
    device: &Device,
    candidates: &[FirmwareCandidate],
    settings: &Settings,
) -> eyre::Result<()> {
    for candidate in candidates {
        let decision = decide(device, candidate, settings.force)?;
        println!(
            "{}\t{}\t{decision:?}\tneeds_upload={}",
            candidate.component, candidate.version, candidate.needs_upload
        );
    }
    Ok(())
}

fn fetch(candidates: &[FirmwareCandidate], settings: &Settings) -> eyre::Result<()> {
    let store = ArtifactStore::new(&settings.downloads)?;
    let downloader = Downloader::new(settings.download_config())?;
    let records = JsonFileRecords::new(&settings.records);
    let cancel = CancellationController::new();

    for candidate in candidates {
        let component = candidate.component;
        if store.has(component, &candidate.version, candidate.checksum.as_deref()) {
            info!("{component} {} already cached", candidate.version);
        } else {
            let mut writer = store.reserve(component)?;
            let mut on_progress = |done: u64, total: Option<u64>| match total {
                Some(total) => info!("{component}: {done}/{total} bytes"),
                None => info!("{component}: {done} bytes"),
            };
            downloader
                .fetch(&candidate.source, &mut writer, &cancel, &mut on_progress)
                .wrap_err_with(|| format!("failed downloading {component}"))?;
            writer.commit(&candidate.version, candidate.checksum.as_deref())?;
        }
        let artifact = store.verify(component, candidate.checksum.as_deref())?;
        records
            .put(
                component,
                CandidateRecord {
                    version: candidate.version.clone(),
                    needs_upload: false,
                },
            )
            .wrap_err("failed recording fetched candidate")?;
        println!("{component}\t{}\t{}", candidate.version, artifact.path.display());
    }
    Ok(())
}
