use crate::{
    config::DeviceConfig,
    device_service_client::DeviceServiceClient,
    middleware::AuthMw,
    page::{StatusSnapshot, render_status},
    services::{
        auth::Credentials,
        firmware::{DeclaredSize, FirmwareUpdater, UploadOutcome},
        knx_mode::{KnxHooks, KnxMode},
        telemetry::DeviceTelemetry,
        update_window::UpdateWindow,
    },
};
use actix_multipart::Multipart;
use actix_web::{HttpResponse, Resource, Responder, Route, http::header, web};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub type StaticResources = HashMap<&'static str, static_files::Resource>;

/// Seconds the browser waits before reloading after a firmware upload
const UPLOAD_REFRESH_SECS: u32 = 10;

#[derive(Deserialize)]
pub struct UploadQuery {
    size: Option<String>,
}

pub struct Api<ServiceClient>
where
    ServiceClient: DeviceServiceClient,
{
    pub service_client: Arc<ServiceClient>,
    pub device: DeviceConfig,
    pub hooks: Arc<KnxHooks>,
    pub update_window: Arc<Mutex<UpdateWindow>>,
    pub firmware: Arc<Mutex<FirmwareUpdater>>,
    pub telemetry: Arc<dyn DeviceTelemetry>,
    pub restart_delay: Duration,
}

impl<ServiceClient> Clone for Api<ServiceClient>
where
    ServiceClient: DeviceServiceClient,
{
    fn clone(&self) -> Self {
        Self {
            service_client: self.service_client.clone(),
            device: self.device.clone(),
            hooks: self.hooks.clone(),
            update_window: self.update_window.clone(),
            firmware: self.firmware.clone(),
            telemetry: self.telemetry.clone(),
            restart_delay: self.restart_delay,
        }
    }
}

impl<ServiceClient> Api<ServiceClient>
where
    ServiceClient: DeviceServiceClient + 'static,
{
    pub fn new(
        service_client: ServiceClient,
        device: DeviceConfig,
        hooks: KnxHooks,
        update_window: UpdateWindow,
        firmware: FirmwareUpdater,
        telemetry: Arc<dyn DeviceTelemetry>,
    ) -> Self {
        Api {
            service_client: Arc::new(service_client),
            device,
            hooks: Arc::new(hooks),
            update_window: Arc::new(Mutex::new(update_window)),
            firmware: Arc::new(Mutex::new(firmware)),
            telemetry,
            restart_delay: Duration::ZERO,
        }
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    /// Register all routes; protected ones are wrapped in [`AuthMw`]
    ///
    /// Expects `Data<Self>`, `Data<Credentials>` and `Data<StaticResources>`
    /// in the app data.
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.service(Self::resource("/", web::get().to(Self::index).wrap(AuthMw)))
            .service(Self::resource("/progmode", web::get().to(Self::prog_mode).wrap(AuthMw)))
            .service(Self::resource("/normalmode", web::get().to(Self::normal_mode).wrap(AuthMw)))
            .service(Self::resource("/knxoff", web::get().to(Self::knx_off).wrap(AuthMw)))
            .service(Self::resource("/otaon", web::get().to(Self::ota_on).wrap(AuthMw)))
            .service(Self::resource("/otaoff", web::get().to(Self::ota_off).wrap(AuthMw)))
            .service(Self::resource("/restart", web::get().to(Self::restart).wrap(AuthMw)))
            .service(Self::resource("/tftupdate", web::get().to(Self::tft_update).wrap(AuthMw)))
            .service(Self::resource("/tftdebug", web::get().to(Self::tft_debug).wrap(AuthMw)))
            .service(Self::resource("/upload", web::post().to(Self::upload).wrap(AuthMw)))
            .service(Self::resource("/webupdate", web::get().to(Self::web_update)))
            .service(Self::resource("/favicon.ico", web::get().to(Self::favicon)))
            .default_service(web::route().to(Self::not_found));
    }

    // a known path with another method is answered like an unknown path
    fn resource(path: &str, route: Route) -> Resource {
        web::resource(path)
            .route(route)
            .default_service(web::route().to(Self::not_found))
    }

    pub async fn index(
        api: web::Data<Self>,
        credentials: web::Data<Credentials>,
    ) -> impl Responder {
        debug!("index() called");

        let snapshot = StatusSnapshot {
            hostname: api.device.hostname.clone(),
            knx_phys_addr: api.device.knx_phys_addr.clone(),
            knx_config_ok: api.device.knx_config_ok,
            mode: api.hooks.mode(),
            ota_remaining: api.update_window().remaining(),
            auth_required: credentials.auth_required(),
            tft_update: api.hooks.has_tft_update(),
            tft_debug: api.hooks.has_tft_debug(),
            telemetry_title: api.telemetry.title(),
            telemetry: api.telemetry.entries(),
        };

        match render_status(&snapshot) {
            Ok(html) => HttpResponse::Ok()
                .content_type(header::ContentType::html())
                .body(html),
            Err(e) => {
                error!("failed to render status page: {e}");
                HttpResponse::InternalServerError().finish()
            }
        }
    }

    pub async fn prog_mode(api: web::Data<Self>) -> impl Responder {
        debug!("prog_mode() called");
        api.set_mode(KnxMode::Prog)
    }

    pub async fn normal_mode(api: web::Data<Self>) -> impl Responder {
        debug!("normal_mode() called");
        api.set_mode(KnxMode::Normal)
    }

    pub async fn knx_off(api: web::Data<Self>) -> impl Responder {
        debug!("knx_off() called");
        api.set_mode(KnxMode::Off)
    }

    pub async fn ota_on(api: web::Data<Self>) -> impl Responder {
        debug!("ota_on() called");
        api.update_window().activate();
        redirect_home()
    }

    pub async fn ota_off(api: web::Data<Self>) -> impl Responder {
        debug!("ota_off() called");
        api.update_window().deactivate();
        redirect_home()
    }

    pub async fn restart(api: web::Data<Self>) -> impl Responder {
        debug!("restart() called");
        api.schedule_restart();
        redirect_home()
    }

    pub async fn tft_update(api: web::Data<Self>) -> impl Responder {
        debug!("tft_update() called");

        let hooks = api.hooks.clone();
        actix_web::rt::spawn(async move {
            if !hooks.trigger_tft_update() {
                debug!("no tft update hook registered");
            }
        });

        redirect_home()
    }

    pub async fn tft_debug(api: web::Data<Self>) -> impl Responder {
        debug!("tft_debug() called");

        let hooks = api.hooks.clone();
        actix_web::rt::spawn(async move {
            if !hooks.trigger_tft_debug() {
                debug!("no tft debug hook registered");
            }
        });

        redirect_home()
    }

    pub async fn web_update(static_resources: web::Data<StaticResources>) -> impl Responder {
        debug!("web_update() called");
        static_resource(&static_resources, "webupdate.html")
    }

    pub async fn favicon(static_resources: web::Data<StaticResources>) -> impl Responder {
        static_resource(&static_resources, "favicon.png")
    }

    pub async fn not_found() -> impl Responder {
        HttpResponse::NotFound().finish()
    }

    /// Stream a multipart firmware upload into the flash target
    ///
    /// The whole body is drained even after the first error; the outcome is
    /// reported once the stream is complete. Form fields other than the first
    /// file are ignored.
    pub async fn upload(
        api: web::Data<Self>,
        query: web::Query<UploadQuery>,
        mut payload: Multipart,
    ) -> impl Responder {
        debug!("upload() called");

        let declared_size = DeclaredSize::from_query(query.size.as_deref());

        let id = match api.firmware().start(declared_size) {
            Ok(id) => id,
            Err(e) => {
                warn!("upload rejected: {e}");
                return HttpResponse::Conflict().body(e.to_string());
            }
        };

        let mut image_seen = false;

        while let Some(field) = payload.next().await {
            let mut field = match field {
                Ok(field) => field,
                Err(e) => {
                    error!("upload stream broken: {e}");
                    api.firmware().abort(id);
                    return HttpResponse::BadRequest().body(e.to_string());
                }
            };

            let is_file = field
                .content_disposition()
                .and_then(|cd| cd.get_filename())
                .is_some();

            // only the first file field is the image
            let is_image = is_file && !image_seen;
            image_seen |= is_file;

            if !is_image {
                debug!("skipping form field {:?}", field.name());
            }

            while let Some(chunk) = field.next().await {
                match chunk {
                    Ok(bytes) if is_image => api.firmware().chunk(id, &bytes),
                    Ok(_) => {}
                    Err(e) => {
                        error!("upload stream broken: {e}");
                        api.firmware().abort(id);
                        return HttpResponse::BadRequest().body(e.to_string());
                    }
                }
            }
        }

        let outcome = {
            let mut firmware = api.firmware();
            firmware.finish(id);
            firmware.take_outcome(id)
        };

        match outcome {
            Some(UploadOutcome::Committed { bytes }) => {
                info!("firmware update of {bytes} bytes successful, restarting");
                api.schedule_restart();
                HttpResponse::TemporaryRedirect()
                    .insert_header((header::LOCATION, "/"))
                    .insert_header(("Refresh", UPLOAD_REFRESH_SECS.to_string()))
                    .finish()
            }
            Some(UploadOutcome::Failed(e)) => {
                error!("firmware update failed: {e}");
                HttpResponse::BadGateway().body(e.to_string())
            }
            None => {
                error!("upload session discarded before completion");
                HttpResponse::InternalServerError().body("upload session discarded")
            }
        }
    }

    /// Periodic maintenance: window expiry, channel pumping, stale uploads
    pub fn tick(&self) {
        self.update_window().tick();

        if self.firmware().expire_stale() {
            warn!("discarded stale firmware upload");
        }
    }

    /// Close the update window on the way out
    pub fn shutdown(&self) {
        self.update_window().deactivate();
    }

    fn set_mode(&self, mode: KnxMode) -> HttpResponse {
        self.hooks.set_mode(mode);
        redirect_home()
    }

    fn schedule_restart(&self) {
        let service_client = self.service_client.clone();
        let delay = self.restart_delay;

        actix_web::rt::spawn(async move {
            tokio::time::sleep(delay).await;

            info!("restarting device");
            if let Err(e) = service_client.reboot().await {
                error!("reboot failed: {e:#}");
            }
        });
    }

    fn update_window(&self) -> MutexGuard<'_, UpdateWindow> {
        self.update_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn firmware(&self) -> MutexGuard<'_, FirmwareUpdater> {
        self.firmware.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn redirect_home() -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, "/"))
        .finish()
}

fn static_resource(static_resources: &StaticResources, name: &str) -> HttpResponse {
    match static_resources.get(name) {
        Some(resource) => HttpResponse::Ok()
            .content_type(resource.mime_type)
            .body(resource.data),
        None => {
            error!("{name} not found in embedded resources");
            HttpResponse::NotFound().finish()
        }
    }
}
