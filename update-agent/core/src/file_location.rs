use std::{borrow::Cow, path::PathBuf, str::FromStr};

use url::{ParseError, Url};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocationError {
    #[error(
        "Failed to extract file path from `file://` scheme URL; URL provided: `{0}`"
    )]
    ExtractFilePath(Url),
    #[error("Failed parsing `{url}` as URL")]
    Parse { url: String, source: ParseError },
    #[error("Scheme `{scheme}` is not supported; URL provided: `{0}`", scheme = .0.scheme())]
    Scheme(Url),
}

impl LocationError {
    fn parse<'a, T: Into<Cow<'a, str>>>(url: T, source: ParseError) -> Self {
        Self::Parse {
            url: url.into().to_string(),
            source,
        }
    }
}

/// Where a firmware image comes from: a remote server, or a file the user picked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalOrRemote {
    Local(PathBuf),
    Remote(Url),
}

impl LocalOrRemote {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(..))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(..))
    }

    /// Plain `http://` URLs parse, but are only fetched when explicitly allowed.
    pub fn is_plain_http(&self) -> bool {
        matches!(self, Self::Remote(url) if url.scheme() == "http")
    }

    pub fn parse(s: &str) -> Result<Self, LocationError> {
        let location = match Url::parse(s) {
            Ok(url) if url.scheme() == "https" || url.scheme() == "http" => url.into(),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|()| LocationError::ExtractFilePath(url))?
                .into(),
            Ok(url) => return Err(LocationError::Scheme(url)),
            Err(ParseError::RelativeUrlWithoutBase) => PathBuf::from(s.to_string()).into(),
            Err(e) => return Err(LocationError::parse(s, e)),
        };
        Ok(location)
    }
}

impl std::fmt::Display for LocalOrRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<PathBuf> for LocalOrRemote {
    fn from(path: PathBuf) -> Self {
        Self::Local(path)
    }
}

impl From<Url> for LocalOrRemote {
    fn from(url: Url) -> Self {
        Self::Remote(url)
    }
}

impl FromStr for LocalOrRemote {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

mod serde_impl {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser::Error as _};

    use super::LocalOrRemote;

    impl<'de> Deserialize<'de> for LocalOrRemote {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            FromStr::from_str(&s).map_err(de::Error::custom)
        }
    }

    impl Serialize for LocalOrRemote {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match self {
                Self::Remote(url) => url.serialize(serializer),
                Self::Local(path) => match path.to_str() {
                    Some(s) => format!("file://{s}").serialize(serializer),
                    None => Err(S::Error::custom(
                        "local path contains invalid UTF-8 characters",
                    )),
                },
            }
        }
    }
}
