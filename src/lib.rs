pub mod api;
pub mod config;
pub mod device_service_client;
pub mod http_client;
pub mod middleware;
pub mod page;
pub mod services;

mod assets {
    // Include the generated static files from build.rs
    include!(concat!(env!("OUT_DIR"), "/generated.rs"));
}

/// Favicon and upload page, embedded at build time
pub fn static_resources() -> api::StaticResources {
    assets::generate()
}
