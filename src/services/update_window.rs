//! Time-bounded window for the out-of-band update channel
//!
//! While the window is open the gateway is reachable by the network updater.
//! It closes on request or once [`OTA_WINDOW_TIMEOUT`] has elapsed, checked by
//! the periodic tick.

use crate::services::{clock::Clock, marker::MarkerFile};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};

pub const OTA_WINDOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The update mechanism gated by the window
pub trait OtaChannel: Send {
    /// One-time initialization, run before the first `begin`
    fn setup(&mut self);
    fn begin(&mut self);
    fn end(&mut self);
    /// Process pending channel events, called on every tick while open
    fn handle(&mut self);
}

pub struct UpdateWindow {
    channel: Box<dyn OtaChannel>,
    clock: Arc<dyn Clock>,
    active: bool,
    initialized: bool,
    start: Duration,
}

impl UpdateWindow {
    pub fn new(channel: Box<dyn OtaChannel>, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            clock,
            active: false,
            initialized: false,
            start: Duration::ZERO,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Open the window, or restart its timer if it is already open
    pub fn activate(&mut self) {
        if !self.initialized {
            self.channel.setup();
            self.initialized = true;
        }

        self.channel.begin();
        self.active = true;
        self.start = self.clock.now();

        info!("update window open for {}s", OTA_WINDOW_TIMEOUT.as_secs());
    }

    pub fn deactivate(&mut self) {
        if !self.active {
            debug!("update window already closed");
            return;
        }

        self.active = false;
        self.channel.end();

        info!("update window closed");
    }

    pub fn tick(&mut self) {
        if !self.active {
            return;
        }

        self.channel.handle();

        if self.elapsed().is_some_and(|elapsed| elapsed > OTA_WINDOW_TIMEOUT) {
            warn!("update window expired");
            self.deactivate();
        }
    }

    /// Time since the window was opened, `None` while closed
    pub fn elapsed(&self) -> Option<Duration> {
        self.active
            .then(|| self.clock.now().saturating_sub(self.start))
    }

    /// Time left until expiry, `None` while closed
    pub fn remaining(&self) -> Option<Duration> {
        self.elapsed()
            .map(|elapsed| OTA_WINDOW_TIMEOUT.saturating_sub(elapsed))
    }

    /// Monotonic timestamp of the last activation, `None` while closed
    pub fn started_at(&self) -> Option<Duration> {
        self.active.then_some(self.start)
    }
}

/// Publishes the window to the network updater through a marker file
pub struct MarkerOtaChannel {
    marker: MarkerFile,
    hostname: String,
}

impl MarkerOtaChannel {
    pub fn new(marker: MarkerFile, hostname: impl Into<String>) -> Self {
        Self {
            marker,
            hostname: hostname.into(),
        }
    }
}

impl OtaChannel for MarkerOtaChannel {
    fn setup(&mut self) {
        info!(
            "update channel for {} at {}",
            self.hostname,
            self.marker.path().display()
        );
        // drop a window left open by a previous run
        self.marker.clear();
    }

    fn begin(&mut self) {
        self.marker.set_or_log();
    }

    fn end(&mut self) {
        self.marker.clear();
    }

    fn handle(&mut self) {
        if !self.marker.exists() {
            warn!("update window marker vanished, restoring it");
            self.marker.set_or_log();
        }
    }
}
