#![allow(dead_code)]

use actix_web::{App, dev::ServiceResponse, http::header, test, web::Data};
use anyhow::Result;
use base64::prelude::*;
use knx_webserver::{
    api::Api,
    config::DeviceConfig,
    device_service_client::DeviceServiceClient,
    services::{
        auth::Credentials,
        clock::Clock,
        firmware::{FileFlashTarget, FirmwareUpdater},
        knx_mode::{KnxHooks, KnxMode},
        telemetry::{StaticTelemetry, TelemetryEntry},
        update_window::{OtaChannel, UpdateWindow},
    },
    static_resources,
};
use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

pub const USER: &str = "admin";
pub const PASSWORD: &str = "knx";
pub const SLOT_CAPACITY: u64 = 4096;

#[derive(Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::SeqCst))
    }
}

pub struct NullChannel;

impl OtaChannel for NullChannel {
    fn setup(&mut self) {}
    fn begin(&mut self) {}
    fn end(&mut self) {}
    fn handle(&mut self) {}
}

/// Counts reboot requests instead of restarting anything
#[derive(Clone, Default)]
pub struct RecordingDevice {
    pub reboots: Arc<AtomicUsize>,
}

impl DeviceServiceClient for RecordingDevice {
    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Gateway {
    pub api: Api<RecordingDevice>,
    pub credentials: Credentials,
    pub clock: Arc<ManualClock>,
    pub reboots: Arc<AtomicUsize>,
    pub modes: Arc<Mutex<Vec<KnxMode>>>,
    pub tft_updates: Arc<AtomicUsize>,
    pub dir: TempDir,
}

impl Gateway {
    /// Gateway with all hooks registered and authentication enabled
    pub fn new() -> Self {
        Self::with_hooks(true)
    }

    pub fn with_hooks(register_hooks: bool) -> Self {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let clock = Arc::new(ManualClock::default());
        let device = RecordingDevice::default();
        let reboots = device.reboots.clone();
        let modes = Arc::new(Mutex::new(Vec::new()));
        let tft_updates = Arc::new(AtomicUsize::new(0));

        let hooks = if register_hooks {
            let sink = modes.clone();
            let counter = tft_updates.clone();
            KnxHooks::new()
                .with_get_mode(|| KnxMode::Normal)
                .with_set_mode(move |mode| sink.lock().unwrap().push(mode))
                .with_tft_update(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
        } else {
            KnxHooks::new()
        };

        let update_window = UpdateWindow::new(Box::new(NullChannel), clock.clone());
        let firmware = FirmwareUpdater::new(
            Box::new(FileFlashTarget::new(
                dir.path().join("firmware.bin"),
                dir.path().join("firmware.bin.part"),
                SLOT_CAPACITY,
            )),
            clock.clone(),
        );

        let api = Api::new(
            device,
            DeviceConfig {
                hostname: "test-gateway".to_string(),
                knx_phys_addr: "1.1.42".to_string(),
                knx_config_ok: true,
            },
            hooks,
            update_window,
            firmware,
            Arc::new(StaticTelemetry::new(
                "System Info",
                vec![TelemetryEntry::new("WIFI Signal", "88%")],
            )),
        );

        Self {
            api,
            credentials: Credentials::new(USER, PASSWORD),
            clock,
            reboots,
            modes,
            tft_updates,
            dir,
        }
    }

    pub fn without_auth(mut self) -> Self {
        self.credentials = Credentials::new("", "");
        self
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.path().join("firmware.bin")
    }

    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    pub async fn service(
        &self,
    ) -> impl actix_service::Service<
        actix_http::Request,
        Response = ServiceResponse,
        Error = actix_web::Error,
    > {
        test::init_service(
            App::new()
                .app_data(Data::new(self.api.clone()))
                .app_data(Data::new(self.credentials.clone()))
                .app_data(Data::new(static_resources()))
                .configure(Api::<RecordingDevice>::configure),
        )
        .await
    }
}

pub fn basic_auth(user: &str, password: &str) -> (header::HeaderName, String) {
    let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
    (header::AUTHORIZATION, format!("Basic {encoded}"))
}

pub fn operator() -> (header::HeaderName, String) {
    basic_auth(USER, PASSWORD)
}

/// Let tasks spawned by handlers run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
