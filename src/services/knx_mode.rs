//! KNX operating mode and the externally registered device hooks
//!
//! The web server never owns the mode. It reads and writes it through
//! callbacks registered by the KNX stack; a callback that was not registered
//! hides the matching control instead of failing.

use anyhow::{Context, Result};
use log::{debug, error, info};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    fmt,
    io::ErrorKind,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum KnxMode {
    Off = 0,
    Normal = 1,
    Prog = 2,
}

impl fmt::Display for KnxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxMode::Off => write!(f, "OFF"),
            KnxMode::Normal => write!(f, "Normal"),
            KnxMode::Prog => write!(f, "PROG"),
        }
    }
}

type GetModeFn = Box<dyn Fn() -> KnxMode + Send + Sync>;
type SetModeFn = Box<dyn Fn(KnxMode) + Send + Sync>;
type TriggerFn = Box<dyn Fn() + Send + Sync>;

/// Callbacks into the rest of the device, all optional
#[derive(Default)]
pub struct KnxHooks {
    get_mode: Option<GetModeFn>,
    set_mode: Option<SetModeFn>,
    tft_update: Option<TriggerFn>,
    tft_debug: Option<TriggerFn>,
}

impl KnxHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_get_mode(mut self, f: impl Fn() -> KnxMode + Send + Sync + 'static) -> Self {
        self.get_mode = Some(Box::new(f));
        self
    }

    pub fn with_set_mode(mut self, f: impl Fn(KnxMode) + Send + Sync + 'static) -> Self {
        self.set_mode = Some(Box::new(f));
        self
    }

    pub fn with_tft_update(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.tft_update = Some(Box::new(f));
        self
    }

    pub fn with_tft_debug(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.tft_debug = Some(Box::new(f));
        self
    }

    /// Current mode as reported by the owner, `None` if no getter is registered
    pub fn mode(&self) -> Option<KnxMode> {
        self.get_mode.as_ref().map(|get| get())
    }

    /// Forward a mode change to the owner
    ///
    /// Returns whether a setter was registered. The owner's acceptance of the
    /// mode is not checked.
    pub fn set_mode(&self, mode: KnxMode) -> bool {
        match &self.set_mode {
            Some(set) => {
                debug!("forwarding knx mode {mode}");
                set(mode);
                true
            }
            None => {
                debug!("no knx mode setter registered, ignoring {mode}");
                false
            }
        }
    }

    pub fn has_tft_update(&self) -> bool {
        self.tft_update.is_some()
    }

    pub fn has_tft_debug(&self) -> bool {
        self.tft_debug.is_some()
    }

    pub fn trigger_tft_update(&self) -> bool {
        Self::fire(&self.tft_update)
    }

    pub fn trigger_tft_debug(&self) -> bool {
        Self::fire(&self.tft_debug)
    }

    fn fire(hook: &Option<TriggerFn>) -> bool {
        match hook {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }
}

/// Mode owner that keeps the mode in a JSON file across restarts
///
/// Used by the gateway binary when the KNX stack runs as a separate process
/// and picks the mode up from the data directory.
pub struct FileModeStore {
    path: PathBuf,
    current: Mutex<KnxMode>,
}

impl FileModeStore {
    /// Open the store, falling back to `Normal` if nothing was persisted yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let current = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).context("failed to parse persisted knx mode")?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => KnxMode::Normal,
            Err(e) => return Err(e).context("failed to read knx mode file"),
        };

        info!("knx mode at startup: {current}");

        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn mode(&self) -> KnxMode {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: KnxMode) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = mode;

        if let Err(e) = self.persist(mode) {
            error!("failed to persist knx mode {mode}: {e:#}");
        }
    }

    fn persist(&self, mode: KnxMode) -> Result<()> {
        let content = serde_json::to_string(&mode).context("failed to serialize knx mode")?;
        std::fs::write(&self.path, content).context("failed to write knx mode file")
    }
}
