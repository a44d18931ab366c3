use std::{
    fs::File,
    io::{self, copy},
    path::{Path, PathBuf},
};

use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("failed to decode hex string as hash: `{0}`")]
    Decode(String, #[source] hex::FromHexError),
    #[error("failed opening `{}` for hashing", .0.display())]
    Open(PathBuf, #[source] io::Error),
    #[error("failed to copy `{}` into hasher", .0.display())]
    Read(PathBuf, #[source] io::Error),
    #[error(
        "mismatch between recorded and actual hashes of `{}`; expected `{expected}`, \
         calculated `{actual}`",
        path.display()
    )]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Hashes the file at `path_to_blob` with sha256 and compares it to a hex encoded digest.
pub fn check_hash<P: AsRef<Path>>(
    path_to_blob: P,
    expected_hex_hash: &str,
) -> Result<(), HashError> {
    let path = path_to_blob.as_ref();
    let decoded_hash = hex::decode(expected_hex_hash.trim())
        .map_err(|e| HashError::Decode(expected_hex_hash.to_string(), e))?;
    let mut hasher = Sha256::new();
    let mut blob =
        File::open(path).map_err(|e| HashError::Open(path.to_path_buf(), e))?;
    copy(&mut blob, &mut hasher).map_err(|e| HashError::Read(path.to_path_buf(), e))?;
    let result = hasher.finalize();
    if *result != decoded_hash {
        return Err(HashError::Mismatch {
            path: path.to_path_buf(),
            expected: expected_hex_hash.to_string(),
            actual: hex::encode(result),
        });
    }
    Ok(())
}

/// Integer percentage of `done` over `total`, saturating at 100.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
    pct as u8
}
