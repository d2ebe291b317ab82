#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::http_client::{handle_http_response, unix_socket_client};
use anyhow::{Context, Result};
use log::info;
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::Client;
use std::path::Path;
use trait_variant::make;

/// Restart facility of the gateway
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait DeviceServiceClient {
    async fn reboot(&self) -> Result<()>;
}

/// Device service reached over its unix socket
#[derive(Clone)]
pub struct GatewayDeviceServiceClient {
    client: Client,
}

impl GatewayDeviceServiceClient {
    const REBOOT_ENDPOINT: &str = "/reboot/v1";

    pub fn new(socket_path: &Path) -> Result<Self> {
        let client = unix_socket_client(&socket_path.to_string_lossy())
            .context("failed to connect to device service")?;

        Ok(Self { client })
    }

    fn build_url(path: &str) -> String {
        format!("http://localhost/{}", path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str) -> Result<String> {
        let url = Self::build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }
}

impl DeviceServiceClient for GatewayDeviceServiceClient {
    async fn reboot(&self) -> Result<()> {
        self.post(Self::REBOOT_ENDPOINT).await.map(|_| ())
    }
}
