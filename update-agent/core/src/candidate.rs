use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{device::ComponentId, file_location::LocalOrRemote};

/// A proposed firmware version for one component, as supplied by the update manifest.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FirmwareCandidate {
    pub component: ComponentId,
    pub version: String,
    #[serde(rename = "url")]
    pub source: LocalOrRemote,
    /// Hex encoded sha256 of the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Changelog keyed by locale, e.g. `en` or `zh-CN`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changelog: BTreeMap<String, String>,
    /// Cleared once the image has been downloaded for this version.
    ///
    /// Informational: whether a session downloads is decided by the artifact store
    /// alone, since the cached image may have been removed since.
    #[serde(default = "default_needs_upload")]
    pub needs_upload: bool,
}

fn default_needs_upload() -> bool {
    true
}

impl FirmwareCandidate {
    pub fn changelog_for(&self, locale: &str) -> Option<&str> {
        self.changelog
            .get(locale)
            .or_else(|| self.changelog.get("en"))
            .map(String::as_str)
    }
}

/// What is remembered about a component's candidate between sessions.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CandidateRecord {
    pub version: String,
    pub needs_upload: bool,
}

/// Orders candidates the way a session processes them and rejects duplicates.
pub fn sort_candidates(
    mut candidates: Vec<FirmwareCandidate>,
) -> Result<Vec<FirmwareCandidate>, DuplicateComponent> {
    candidates.sort_by_key(|c| c.component);
    if let Some(pair) = candidates.windows(2).find(|w| w[0].component == w[1].component)
    {
        return Err(DuplicateComponent(pair[0].component));
    }
    Ok(candidates)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("more than one candidate supplied for component `{0}`")]
pub struct DuplicateComponent(pub ComponentId);
