use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::error::{AppError, AppResult};

/// Build a standard HTTP client with reasonable defaults.
pub fn build_client() -> AppResult<Client> {
    ClientBuilder::new()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))
}
