//! Local cache of downloaded firmware images.
//!
//! Every component has at most one cached image at `<dir>/<component>.<ext>`, next to a
//! `<component>.verified` marker recording the candidate it was downloaded for. Downloads
//! are written to `<component>.<ext>.part` and only renamed into place on
//! [`ArtifactWriter::commit`], so an interrupted download never becomes visible.
use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wallet_update_agent_core::{ComponentId, FirmwareVersion};

use crate::util::{self, HashError};

/// Upper bound on the size of any cached image.
pub const MAX_ARTIFACT_SIZE: u64 = 32 * 1024 * 1024;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const MAIN_MAGICS: [&[u8; 4]; 3] = [b"TRZR", b"TRZV", b"TRZF"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no cached artifact for component `{0}`")]
    ArtifactMissing(ComponentId),
    #[error("a download of component `{0}` is already in progress")]
    WriteInProgress(ComponentId),
    #[error("artifact of component `{component}` failed its integrity check")]
    IntegrityCheckFailed {
        component: ComponentId,
        source: HashError,
    },
    #[error("artifact of component `{component}` is not a valid `.{extension}` image: {reason}")]
    CorruptArtifact {
        component: ComponentId,
        extension: &'static str,
        reason: String,
    },
    #[error("failed accessing `{}`", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed encoding verification marker `{}`", path.display())]
    Marker {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(component: ComponentId, reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            component,
            extension: component.artifact_extension(),
            reason: reason.into(),
        }
    }
}

/// A committed image on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalArtifact {
    pub component: ComponentId,
    pub path: PathBuf,
    pub extension: &'static str,
}

/// What a committed image was downloaded for.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
struct VerifiedMarker {
    version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    reserved: Arc<Mutex<HashSet<ComponentId>>>,
}

impl ArtifactStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            dir,
            reserved: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, component: ComponentId) -> PathBuf {
        self.dir
            .join(format!("{component}.{}", component.artifact_extension()))
    }

    fn marker_path(&self, component: ComponentId) -> PathBuf {
        self.dir.join(format!("{component}.verified"))
    }

    fn read_marker(&self, component: ComponentId) -> Option<VerifiedMarker> {
        let path = self.marker_path(component);
        let file = File::open(&path).ok()?;
        match crate::json::deserialize(file) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("ignoring unreadable marker `{}`: {e:?}", path.display());
                None
            }
        }
    }

    /// `true` iff a committed image exists whose marker records `version` and, when the
    /// candidate carries one, the same `checksum`.
    pub fn has(&self, component: ComponentId, version: &str, checksum: Option<&str>) -> bool {
        if !self.artifact_path(component).is_file() {
            return false;
        }
        let Some(marker) = self.read_marker(component) else {
            return false;
        };
        let same_version = match (
            FirmwareVersion::parse(&marker.version),
            FirmwareVersion::parse(version),
        ) {
            (Ok(recorded), Ok(expected)) => recorded == expected,
            _ => marker.version == version,
        };
        let same_checksum = match checksum {
            None => true,
            Some(expected) => marker
                .checksum
                .as_deref()
                .is_some_and(|recorded| recorded.eq_ignore_ascii_case(expected)),
        };
        same_version && same_checksum
    }

    /// Opens the committed image of `component` for reading.
    pub fn open(&self, component: ComponentId) -> Result<ArtifactReader, StoreError> {
        let path = self.artifact_path(component);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::ArtifactMissing(component));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();
        Ok(ArtifactReader {
            artifact: LocalArtifact {
                component,
                path,
                extension: component.artifact_extension(),
            },
            file,
            len,
        })
    }

    /// Reserves exclusive write access to `component` and truncates its download target.
    pub fn reserve(&self, component: ComponentId) -> Result<ArtifactWriter, StoreError> {
        {
            let mut reserved = lock(&self.reserved);
            if !reserved.insert(component) {
                return Err(StoreError::WriteInProgress(component));
            }
        }
        let reservation = Reservation {
            component,
            reserved: Arc::clone(&self.reserved),
        };

        let final_path = self.artifact_path(component);
        let part_path = part_path(&final_path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&part_path)
            .map_err(|e| StoreError::io(&part_path, e))?;
        debug!("reserved `{}` for download", part_path.display());

        Ok(ArtifactWriter {
            file: Some(file),
            part_path,
            final_path,
            marker_path: self.marker_path(component),
            written: 0,
            committed: false,
            _reservation: reservation,
        })
    }

    /// Deletes the image of `component` and its marker. Missing files are not an error.
    pub fn discard(&self, component: ComponentId) -> Result<(), StoreError> {
        for path in [self.marker_path(component), self.artifact_path(component)] {
            match fs::remove_file(&path) {
                Ok(()) => info!("discarded `{}`", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(())
    }

    /// Validates the committed image of `component`.
    ///
    /// Without a checksum only size and magic bytes are checked. With one, the sha256 of
    /// the image must match and the image is discarded when it does not.
    pub fn verify(
        &self,
        component: ComponentId,
        checksum: Option<&str>,
    ) -> Result<LocalArtifact, StoreError> {
        let mut reader = self.open(component)?;
        if reader.len == 0 {
            return Err(StoreError::corrupt(component, "image is empty"));
        }
        if reader.len > MAX_ARTIFACT_SIZE {
            return Err(StoreError::corrupt(
                component,
                format!("image of {} bytes exceeds {MAX_ARTIFACT_SIZE}", reader.len),
            ));
        }

        let mut magic = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut magic) {
            return Err(StoreError::corrupt(
                component,
                format!("failed reading magic bytes: {e}"),
            ));
        }
        let magic_ok = match component {
            ComponentId::Main => MAIN_MAGICS.iter().any(|m| **m == magic),
            ComponentId::Radio => magic == *ZIP_MAGIC,
        };
        if !magic_ok {
            return Err(StoreError::corrupt(
                component,
                format!("unexpected magic bytes `{}`", hex::encode(magic)),
            ));
        }

        let artifact = reader.artifact;
        if let Some(checksum) = checksum {
            if let Err(source) = util::check_hash(&artifact.path, checksum) {
                warn!("checksum of `{}` does not match, discarding", artifact.path.display());
                if let Err(e) = self.discard(component) {
                    warn!("failed discarding `{}`: {e:?}", artifact.path.display());
                }
                return Err(StoreError::IntegrityCheckFailed { component, source });
            }
        }
        Ok(artifact)
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Reservation {
    component: ComponentId,
    reserved: Arc<Mutex<HashSet<ComponentId>>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock(&self.reserved).remove(&self.component);
    }
}

/// Readable handle to a committed image.
#[derive(Debug)]
pub struct ArtifactReader {
    pub artifact: LocalArtifact,
    file: File,
    len: u64,
}

impl ArtifactReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the whole image into memory.
    pub fn into_bytes(mut self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file
            .read_to_end(&mut buf)
            .map_err(|e| StoreError::io(&self.artifact.path, e))?;
        Ok(buf)
    }
}

impl Read for ArtifactReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Exclusive write handle for one component's download.
///
/// Dropping the writer without committing deletes the partial file and releases the
/// reservation.
#[derive(Debug)]
pub struct ArtifactWriter {
    file: Option<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    marker_path: PathBuf,
    written: u64,
    committed: bool,
    _reservation: Reservation,
}

impl ArtifactWriter {
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Makes the download visible, recording the candidate it was fetched for.
    pub fn commit(
        mut self,
        version: &str,
        checksum: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| StoreError::io(&self.part_path, e))?;
        }
        match fs::remove_file(&self.marker_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&self.marker_path, e)),
        }
        fs::rename(&self.part_path, &self.final_path)
            .map_err(|e| StoreError::io(&self.final_path, e))?;
        self.committed = true;

        let marker = VerifiedMarker {
            version: version.to_string(),
            checksum: checksum.map(str::to_string),
        };
        let encoded =
            serde_json::to_vec(&marker).map_err(|source| StoreError::Marker {
                path: self.marker_path.clone(),
                source,
            })?;
        fs::write(&self.marker_path, encoded)
            .map_err(|e| StoreError::io(&self.marker_path, e))?;
        info!(
            "committed `{}` ({} bytes) for version {version}",
            self.final_path.display(),
            self.written
        );
        Ok(())
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("artifact writer already committed"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        match fs::remove_file(&self.part_path) {
            Ok(()) => debug!("removed partial download `{}`", self.part_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "failed removing partial download `{}`: {e:?}",
                self.part_path.display()
            ),
        }
    }
}
