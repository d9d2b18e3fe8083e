use std::time::Duration;

use reqwest::Client;

use crate::error::UpdateError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn build_client(timeout: Duration) -> Result<Client, UpdateError> {
    Client::builder()
        .user_agent(concat!("ota-updater/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|e| UpdateError::network("failed to build http client", e))
}
