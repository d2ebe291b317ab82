//! Gateway state and the platform glue behind it
//!
//! Everything in here is independent of HTTP and can be driven directly
//! from tests.

pub mod auth;
pub mod clock;
pub mod firmware;
pub mod knx_mode;
pub mod marker;
pub mod telemetry;
pub mod update_window;
