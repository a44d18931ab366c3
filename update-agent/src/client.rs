use std::time::Duration;

use reqwest::blocking::Client;

const APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed initializing HTTP client")]
    BuildClient(#[source] reqwest::Error),
}

/// Returns an HTTP client for firmware downloads.
///
/// `stall_timeout` bounds every connect and read, so a server that stops sending data
/// surfaces as a timeout instead of blocking the worker. Plain `http` is only permitted
/// when `allow_http` is set.
pub fn build(stall_timeout: Duration, allow_http: bool) -> Result<Client, Error> {
    Client::builder()
        .tls_built_in_root_certs(true)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .redirect(reqwest::redirect::Policy::limited(5))
        .https_only(!allow_http)
        .user_agent(APP_USER_AGENT)
        .connect_timeout(stall_timeout)
        .timeout(stall_timeout)
        .build()
        .map_err(Error::BuildClient)
}
