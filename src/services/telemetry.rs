//! Hardware and network figures shown at the bottom of the status page

use log::debug;
use std::{fs, path::PathBuf};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TelemetryEntry {
    pub label: String,
    pub value: String,
}

impl TelemetryEntry {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

pub trait DeviceTelemetry: Send + Sync {
    /// Heading of the telemetry section
    fn title(&self) -> String;
    /// Figures to show; unavailable ones are left out
    fn entries(&self) -> Vec<TelemetryEntry>;
}

/// Convert a Wi-Fi signal level in dBm into a 0..=100 quality percentage
pub fn rssi_quality(dbm: i32) -> u8 {
    if dbm <= -100 {
        0
    } else if dbm >= -50 {
        100
    } else {
        (2 * (dbm + 100)) as u8
    }
}

/// Telemetry read from a Linux procfs/sysfs tree
///
/// `root` is `/` on the device; tests point it at a fake tree.
pub struct ProcTelemetry {
    root: PathBuf,
}

impl ProcTelemetry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, relative: &str) -> Option<String> {
        let path = self.root.join(relative);
        match fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                debug!("telemetry source {} unavailable: {e}", path.display());
                None
            }
        }
    }

    fn memory(&self) -> Vec<TelemetryEntry> {
        let Some(meminfo) = self.read("proc/meminfo") else {
            return vec![];
        };

        [("MemTotal:", "Memory size"), ("MemAvailable:", "Free memory")]
            .into_iter()
            .filter_map(|(key, label)| {
                meminfo_kib(&meminfo, key).map(|kib| TelemetryEntry::new(label, format_kib(kib)))
            })
            .collect()
    }

    fn load(&self) -> Option<TelemetryEntry> {
        let loadavg = self.read("proc/loadavg")?;
        let load: Vec<&str> = loadavg.split_whitespace().take(3).collect();
        (load.len() == 3).then(|| TelemetryEntry::new("Load average", load.join(" ")))
    }

    fn uptime(&self) -> Option<TelemetryEntry> {
        let uptime = self.read("proc/uptime")?;
        let seconds = uptime.split_whitespace().next()?.parse::<f64>().ok()? as u64;
        Some(TelemetryEntry::new("Uptime", format_uptime(seconds)))
    }

    fn temperature(&self) -> Option<TelemetryEntry> {
        let raw = self.read("sys/class/thermal/thermal_zone0/temp")?;
        let millidegrees = raw.trim().parse::<i64>().ok()?;
        Some(TelemetryEntry::new(
            "Chip temperature",
            format!("{:.1}°C", millidegrees as f64 / 1000.0),
        ))
    }

    fn wifi_signal(&self) -> Option<TelemetryEntry> {
        let wireless = self.read("proc/net/wireless")?;
        let dbm = wireless_level(&wireless)?;
        Some(TelemetryEntry::new(
            "WIFI Signal",
            format!("{}%", rssi_quality(dbm)),
        ))
    }
}

impl DeviceTelemetry for ProcTelemetry {
    fn title(&self) -> String {
        "System Info".to_string()
    }

    fn entries(&self) -> Vec<TelemetryEntry> {
        let mut entries = self.memory();
        entries.extend(self.load());
        entries.extend(self.uptime());
        entries.extend(self.temperature());
        entries.extend(self.wifi_signal());
        entries
    }
}

/// Fixed figures, for platforms without a readable procfs
pub struct StaticTelemetry {
    title: String,
    entries: Vec<TelemetryEntry>,
}

impl StaticTelemetry {
    pub fn new(title: impl Into<String>, entries: Vec<TelemetryEntry>) -> Self {
        Self {
            title: title.into(),
            entries,
        }
    }
}

impl DeviceTelemetry for StaticTelemetry {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn entries(&self) -> Vec<TelemetryEntry> {
        self.entries.clone()
    }
}

fn meminfo_kib(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

fn format_kib(kib: u64) -> String {
    if kib >= 1024 * 1024 {
        format!("{:.1}GB", kib as f64 / 1024.0 / 1024.0)
    } else if kib >= 1024 {
        format!("{:.1}MB", kib as f64 / 1024.0)
    } else {
        format!("{kib}KB")
    }
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = seconds % 86_400 / 3_600;
    let minutes = seconds % 3_600 / 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else {
        format!("{hours}h {minutes}m")
    }
}

// first interface line of /proc/net/wireless, e.g.
// "wlan0: 0000   54.  -56.  -256        0      0      0      0      0        0"
fn wireless_level(wireless: &str) -> Option<i32> {
    let line = wireless.lines().skip(2).find(|line| line.contains(':'))?;
    let (_, stats) = line.split_once(':')?;
    let level = stats.split_whitespace().nth(2)?;
    level.trim_end_matches('.').parse::<f64>().ok().map(|dbm| dbm as i32)
}
