//! Candidate metadata remembered between sessions.
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::debug;
use wallet_update_agent_core::{CandidateRecord, ComponentId, FirmwareCandidate};

#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    #[error("failed reading records from `{}`", .0.display())]
    Read(PathBuf, #[source] io::Error),
    #[error("records at `{}` are malformed", .0.display())]
    Parse(PathBuf, #[source] crate::json::Error),
    #[error("failed writing records to `{}`", .0.display())]
    Write(PathBuf, #[source] io::Error),
    #[error("failed encoding records")]
    Encode(#[source] serde_json::Error),
}

/// Get/put access to the per component candidate records.
pub trait CandidateRecords: Send + Sync {
    fn get(&self, component: ComponentId) -> Result<Option<CandidateRecord>, RecordsError>;
    fn put(
        &self,
        component: ComponentId,
        record: CandidateRecord,
    ) -> Result<(), RecordsError>;
}

/// Records kept as a single JSON object keyed by component.
#[derive(Debug)]
pub struct JsonFileRecords {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRecords {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<ComponentId, CandidateRecord>, RecordsError> {
        match File::open(&self.path) {
            Ok(file) => crate::json::deserialize(file)
                .map_err(|e| RecordsError::Parse(self.path.clone(), e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(RecordsError::Read(self.path.clone(), e)),
        }
    }

    /// Replaces the file through a rename so readers never see a partial write.
    fn store(
        &self,
        records: &BTreeMap<ComponentId, CandidateRecord>,
    ) -> Result<(), RecordsError> {
        let encoded = serde_json::to_vec_pretty(records).map_err(RecordsError::Encode)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let write_err = |e| RecordsError::Write(self.path.clone(), e);
        std::fs::create_dir_all(dir).map_err(write_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&encoded).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

impl CandidateRecords for JsonFileRecords {
    fn get(&self, component: ComponentId) -> Result<Option<CandidateRecord>, RecordsError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.load()?.remove(&component))
    }

    fn put(
        &self,
        component: ComponentId,
        record: CandidateRecord,
    ) -> Result<(), RecordsError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut records = self.load()?;
        debug!("recording {component} candidate {record:?}");
        records.insert(component, record);
        self.store(&records)
    }
}

/// In-memory records, for callers without persistent storage.
#[derive(Debug, Default)]
pub struct MemoryRecords(Mutex<BTreeMap<ComponentId, CandidateRecord>>);

impl CandidateRecords for MemoryRecords {
    fn get(&self, component: ComponentId) -> Result<Option<CandidateRecord>, RecordsError> {
        let records = self.0.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(&component).cloned())
    }

    fn put(
        &self,
        component: ComponentId,
        record: CandidateRecord,
    ) -> Result<(), RecordsError> {
        let mut records = self.0.lock().unwrap_or_else(|p| p.into_inner());
        records.insert(component, record);
        Ok(())
    }
}

/// Carries `needs_upload = false` over to candidates whose version was already fetched.
pub fn reconcile(
    records: &dyn CandidateRecords,
    candidates: &mut [FirmwareCandidate],
) -> Result<(), RecordsError> {
    for candidate in candidates {
        let Some(record) = records.get(candidate.component)? else {
            continue;
        };
        let same_version = wallet_update_agent_core::version::compare(
            &record.version,
            &candidate.version,
        )
        .is_ok_and(|ord| ord.is_eq());
        if same_version && !record.needs_upload {
            candidate.needs_upload = false;
        }
    }
    Ok(())
}
