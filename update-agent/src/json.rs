use std::io;

use serde::Deserialize;
use serde_json::Deserializer;

#[derive(Debug, thiserror::Error)]
#[error("failed to deserialize json")]
pub struct Error(#[source] pub serde_path_to_error::Error<serde_json::Error>);

impl Error {
    /// The path to the offending field, e.g. `[1].version`.
    pub fn path(&self) -> String {
        self.0.path().to_string()
    }
}

/// Deserializes `T` from `reader`, tracking the path to the field that failed.
pub fn deserialize<'de, R, T>(reader: R) -> Result<T, Error>
where
    R: io::Read,
    T: Deserialize<'de>,
{
    let json_deserializer = &mut Deserializer::from_reader(reader);
    serde_path_to_error::deserialize(json_deserializer).map_err(Error)
}
