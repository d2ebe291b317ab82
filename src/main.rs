use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use knx_webserver::{
    api::Api,
    config::{AppConfig, CertificateConfig},
    device_service_client::GatewayDeviceServiceClient,
    services::{
        auth::Credentials,
        clock::{Clock, MonotonicClock},
        firmware::{FileFlashTarget, FirmwareUpdater},
        knx_mode::{FileModeStore, KnxHooks},
        marker::MarkerFile,
        telemetry::ProcTelemetry,
        update_window::{MarkerOtaChannel, UpdateWindow},
    },
    static_resources,
};
use log::{debug, error, info};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::{io::Write, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

type UiApi = Api<GatewayDeviceServiceClient>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let config = AppConfig::get();
    debug!("configuration: {config:?}");

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let service_client = GatewayDeviceServiceClient::new(&config.device_service.socket_path)
        .context("failed to create device service client")?;

    let credentials = Credentials::from(&config.auth);
    if !credentials.auth_required() {
        info!("no username configured, web interface is unprotected");
    }

    let api = create_api(config, service_client)?;

    let maintenance = tokio::spawn(run_maintenance(api.clone()));
    let (server_handle, server_task) = run_server(api.clone(), credentials)?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");

    server_handle.stop(true).await;
    maintenance.abort();
    api.shutdown();

    info!("shutdown complete");

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!(
        "module version: {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHORT_REV")
    );

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

fn create_api(config: &AppConfig, service_client: GatewayDeviceServiceClient) -> Result<UiApi> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let paths = &config.paths;

    let update_window = UpdateWindow::new(
        Box::new(MarkerOtaChannel::new(
            MarkerFile::new(&paths.ota_marker, "update window"),
            config.device.hostname.clone(),
        )),
        clock.clone(),
    );

    let firmware = FirmwareUpdater::new(
        Box::new(FileFlashTarget::new(
            &paths.firmware_image,
            &paths.firmware_staging,
            config.firmware.max_size,
        )),
        clock,
    );

    let api = Api::new(
        service_client,
        config.device.clone(),
        create_hooks(config)?,
        update_window,
        firmware,
        Arc::new(ProcTelemetry::new("/")),
    )
    .with_restart_delay(config.ui.restart_delay);

    Ok(api)
}

fn create_hooks(config: &AppConfig) -> Result<KnxHooks> {
    let store = Arc::new(
        FileModeStore::open(&config.paths.mode_file).context("failed to open knx mode store")?,
    );
    let getter = store.clone();

    let mut hooks = KnxHooks::new()
        .with_get_mode(move || getter.mode())
        .with_set_mode(move |mode| store.set_mode(mode));

    if config.ui.tft_hooks {
        let update = MarkerFile::new(&config.paths.tft_update_marker, "tft update");
        let debug = MarkerFile::new(&config.paths.tft_debug_marker, "tft debug");

        hooks = hooks
            .with_tft_update(move || update.set_or_log())
            .with_tft_debug(move || debug.set_or_log());
    }

    Ok(hooks)
}

async fn run_maintenance(api: UiApi) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        interval.tick().await;
        api.tick();
    }
}

fn run_server(
    api: UiApi,
    credentials: Credentials,
) -> Result<(ServerHandle, JoinHandle<Result<(), std::io::Error>>)> {
    let config = AppConfig::get();
    let address = ("0.0.0.0", config.ui.port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .app_data(Data::new(credentials.clone()))
            .app_data(Data::new(static_resources()))
            .configure(UiApi::configure)
    })
    .workers(1)
    .disable_signals();

    let server = match &config.certificate {
        Some(certificate) => {
            let tls_config = load_tls_config(certificate).context("failed to load tls config")?;
            info!("serving https on port {}", config.ui.port);
            server
                .bind_rustls_0_23(address, tls_config)
                .context("failed to bind server")?
        }
        None => {
            info!("serving http on port {}", config.ui.port);
            server.bind(address).context("failed to bind server")?
        }
    }
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}

fn load_tls_config(paths: &CertificateConfig) -> Result<rustls::ServerConfig> {
    let mut tls_certs = std::io::BufReader::new(
        std::fs::File::open(&paths.cert_path).context("failed to open certificate file")?,
    );

    let mut tls_key = std::io::BufReader::new(
        std::fs::File::open(&paths.key_path).context("failed to open key file")?,
    );

    let tls_certs = rustls_pemfile::certs(&mut tls_certs)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate pem")?;

    let key_item = rustls_pemfile::read_one(&mut tls_key)
        .context("failed to read key pem file")?
        .context("no valid key found in pem file")?;

    let key = match key_item {
        rustls_pemfile::Item::Pkcs1Key(key) => rustls::pki_types::PrivateKeyDer::Pkcs1(key),
        rustls_pemfile::Item::Pkcs8Key(key) => rustls::pki_types::PrivateKeyDer::Pkcs8(key),
        rustls_pemfile::Item::Sec1Key(key) => rustls::pki_types::PrivateKeyDer::Sec1(key),
        _ => anyhow::bail!("unexpected key type in pem file"),
    };

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(tls_certs, key)
        .context("failed to create tls config")
}
