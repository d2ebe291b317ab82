use anyhow::{Context, Result, bail};
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// UI server configuration
    pub ui: UiConfig,

    /// Operator credentials for HTTP Basic authentication
    pub auth: AuthConfig,

    /// Values shown on the status page
    pub device: DeviceConfig,

    /// Device service client configuration
    pub device_service: DeviceServiceConfig,

    /// Optional TLS certificate configuration
    pub certificate: Option<CertificateConfig>,

    /// Firmware image slot configuration
    pub firmware: FirmwareConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
    pub restart_delay: Duration,
    pub tft_hooks: bool,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub hostname: String,
    pub knx_phys_addr: String,
    pub knx_config_ok: bool,
}

#[derive(Clone, Debug)]
pub struct DeviceServiceConfig {
    pub socket_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FirmwareConfig {
    pub max_size: u64,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub mode_file: PathBuf,
    pub firmware_image: PathBuf,
    pub firmware_staging: PathBuf,
    pub ota_marker: PathBuf,
    pub tft_update_marker: PathBuf,
    pub tft_debug_marker: PathBuf,
}

const DEFAULT_FIRMWARE_MAX_SIZE: u64 = 16 * 1024 * 1024;

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// On first call the configuration is read from environment variables and
    /// cached; later calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The gateway cannot serve
    /// anything meaningful without a valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            ui: UiConfig::load()?,
            auth: AuthConfig::load(),
            device: DeviceConfig::load()?,
            device_service: DeviceServiceConfig::load(),
            certificate: CertificateConfig::load()?,
            firmware: FirmwareConfig::load()?,
            paths: PathConfig::load()?,
        })
    }
}

impl UiConfig {
    fn load() -> Result<Self> {
        let port = env::var("UI_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("failed to parse UI_PORT: invalid format")?;

        let restart_delay = env::var("RESTART_DELAY_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse::<u64>()
            .map(Duration::from_millis)
            .context("failed to parse RESTART_DELAY_MS: invalid format")?;

        let tft_hooks = parse_flag(env::var("TFT_HOOKS").ok(), false)
            .context("failed to parse TFT_HOOKS")?;

        Ok(Self {
            port,
            restart_delay,
            tft_hooks,
        })
    }
}

impl AuthConfig {
    fn load() -> Self {
        Self {
            username: env::var("WEB_USERNAME").unwrap_or_default(),
            password: env::var("WEB_PASSWORD").unwrap_or_default(),
        }
    }
}

impl DeviceConfig {
    fn load() -> Result<Self> {
        let hostname = env::var("DEVICE_HOSTNAME").unwrap_or_else(|_| "KNX-Gateway".to_string());
        let knx_phys_addr = env::var("KNX_PHYS_ADDR").unwrap_or_else(|_| "0.0.0".to_string());
        let knx_config_ok = parse_flag(env::var("KNX_CONFIG_OK").ok(), false)
            .context("failed to parse KNX_CONFIG_OK")?;

        Ok(Self {
            hostname,
            knx_phys_addr,
            knx_config_ok,
        })
    }
}

impl DeviceServiceConfig {
    fn load() -> Self {
        let socket_path = env::var("SOCKET_PATH")
            .unwrap_or_else(|_| "/socket/api.sock".to_string())
            .into();

        Self { socket_path }
    }
}

impl CertificateConfig {
    fn load() -> Result<Option<Self>> {
        match (env::var("CERT_PATH").ok(), env::var("KEY_PATH").ok()) {
            (Some(cert_path), Some(key_path)) => Ok(Some(Self {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            })),
            (None, None) => Ok(None),
            _ => bail!("failed to load certificate config: CERT_PATH and KEY_PATH must be set together"),
        }
    }
}

impl FirmwareConfig {
    fn load() -> Result<Self> {
        let max_size = match env::var("FIRMWARE_MAX_SIZE") {
            Ok(value) => value
                .parse::<u64>()
                .context("failed to parse FIRMWARE_MAX_SIZE: invalid format")?,
            Err(_) => DEFAULT_FIRMWARE_MAX_SIZE,
        };

        Ok(Self { max_size })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string()));

        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        Ok(Self::in_dir(data_dir))
    }

    /// Lay out all files of the gateway below `data_dir`
    pub fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            mode_file: data_dir.join("knx_mode.json"),
            firmware_image: data_dir.join("firmware.bin"),
            firmware_staging: data_dir.join("firmware.bin.part"),
            ota_marker: data_dir.join("ota_window_open"),
            tft_update_marker: data_dir.join("tft_update_requested"),
            tft_debug_marker: data_dir.join("tft_debug_requested"),
            data_dir,
        }
    }
}

fn parse_flag(value: Option<String>, default: bool) -> Result<bool> {
    let Some(value) = value else {
        return Ok(default);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("invalid flag value: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert!(parse_flag(Some("true".to_string()), false).unwrap());
        assert!(parse_flag(Some("ON".to_string()), false).unwrap());
        assert!(parse_flag(Some("1".to_string()), false).unwrap());
        assert!(!parse_flag(Some("no".to_string()), true).unwrap());
        assert!(!parse_flag(Some(String::new()), true).unwrap());
    }

    #[test]
    fn parse_flag_falls_back_to_default() {
        assert!(parse_flag(None, true).unwrap());
        assert!(!parse_flag(None, false).unwrap());
    }

    #[test]
    fn parse_flag_rejects_garbage() {
        assert!(parse_flag(Some("maybe".to_string()), false).is_err());
    }

    #[test]
    fn path_config_places_everything_in_data_dir() {
        let paths = PathConfig::in_dir(PathBuf::from("/tmp/knx"));

        assert_eq!(paths.firmware_image, PathBuf::from("/tmp/knx/firmware.bin"));
        assert_eq!(
            paths.firmware_staging,
            PathBuf::from("/tmp/knx/firmware.bin.part")
        );
        assert!(paths.ota_marker.starts_with(&paths.data_dir));
        assert!(paths.mode_file.starts_with(&paths.data_dir));
    }

    #[test]
    fn auth_config_debug_hides_password() {
        let auth = AuthConfig {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };

        let printed = format!("{auth:?}");
        assert!(printed.contains("admin"));
        assert!(!printed.contains("secret"));
    }
}
