use std::fs;
use std::path::{Path, PathBuf};

use crate::provider::{MetricsProvider, MetricsSourceError};
use crate::sample::DeviceMetrics;

const SOURCE_NAME: &str = "sysfs";
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Secondary metrics source: DRM sysfs attributes exposed by amdgpu-style
/// kernel drivers under `/sys/class/drm/card*/device`.
#[derive(Debug, Clone)]
pub struct SysfsProvider {
    drm_root: PathBuf,
}

impl SysfsProvider {
    pub fn new(drm_root: impl Into<PathBuf>) -> Self {
        Self {
            drm_root: drm_root.into(),
        }
    }
}

impl Default for SysfsProvider {
    fn default() -> Self {
        Self::new("/sys/class/drm")
    }
}

impl MetricsProvider for SysfsProvider {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn sample(&mut self) -> Result<Vec<DeviceMetrics>, MetricsSourceError> {
        if !self.drm_root.is_dir() {
            return Err(MetricsSourceError::Unavailable {
                source_name: SOURCE_NAME.to_string(),
                reason: format!("{} does not exist", self.drm_root.display()),
            });
        }

        let mut cards: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.drm_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(card_index) else {
                continue;
            };
            cards.push((index, entry.path().join("device")));
        }
        cards.sort_by_key(|(index, _)| *index);

        let devices: Vec<DeviceMetrics> = cards
            .iter()
            .map(|(_, device_dir)| read_card(device_dir))
            .filter(|metrics| !metrics.is_empty())
            .collect();
        if devices.is_empty() {
            return Err(MetricsSourceError::NoDevices(SOURCE_NAME.to_string()));
        }
        Ok(devices)
    }
}

/// `card0` -> 0; connector entries such as `card0-DP-1` are skipped.
fn card_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("card")?;
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn read_card(device_dir: &Path) -> DeviceMetrics {
    let mut metrics = DeviceMetrics {
        utilization_pct: read_number(&device_dir.join("gpu_busy_percent")),
        memory_utilization_pct: read_number(&device_dir.join("mem_busy_percent")),
        memory_used_mib: read_number(&device_dir.join("mem_info_vram_used"))
            .map(|bytes| bytes / BYTES_PER_MIB),
        memory_total_mib: read_number(&device_dir.join("mem_info_vram_total"))
            .map(|bytes| bytes / BYTES_PER_MIB),
        sm_clock_mhz: read_active_clock(&device_dir.join("pp_dpm_sclk")),
        memory_clock_mhz: read_active_clock(&device_dir.join("pp_dpm_mclk")),
        ..DeviceMetrics::default()
    };

    if let Some(hwmon) = first_hwmon(device_dir) {
        metrics.temperature_c =
            read_number(&hwmon.join("temp1_input")).map(|millidegrees| millidegrees / 1000.0);
        metrics.power_w = read_number(&hwmon.join("power1_average"))
            .or_else(|| read_number(&hwmon.join("power1_input")))
            .map(|microwatts| microwatts / 1_000_000.0);
    }

    metrics
}

fn first_hwmon(device_dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(device_dir.join("hwmon"))
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    entries.sort();
    entries.into_iter().next()
}

fn read_number(path: &Path) -> Option<f64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Picks the DPM level marked active (`*`), e.g. `1: 1800Mhz *`.
fn read_active_clock(path: &Path) -> Option<f64> {
    let contents = fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find(|line| line.trim_end().ends_with('*'))
        .and_then(parse_clock_line)
}

fn parse_clock_line(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once(':')?;
    let value = rest.trim().trim_end_matches('*').trim();
    let lower = value.to_ascii_lowercase();
    lower.strip_suffix("mhz")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fake_card(root: &Path, name: &str) -> PathBuf {
        let device = root.join(name).join("device");
        write(&device.join("gpu_busy_percent"), "73\n");
        write(&device.join("mem_busy_percent"), "12\n");
        write(&device.join("mem_info_vram_used"), "1073741824\n");
        write(&device.join("mem_info_vram_total"), "8589934592\n");
        write(
            &device.join("pp_dpm_sclk"),
            "0: 500Mhz\n1: 1800Mhz *\n2: 2100Mhz\n",
        );
        write(&device.join("pp_dpm_mclk"), "0: 96Mhz\n1: 1000Mhz *\n");
        write(&device.join("hwmon/hwmon3/temp1_input"), "54000\n");
        write(&device.join("hwmon/hwmon3/power1_average"), "118000000\n");
        device
    }

    #[test]
    fn reads_amdgpu_style_attributes() {
        let root = TempDir::new().unwrap();
        fake_card(root.path(), "card0");
        fs::create_dir_all(root.path().join("card0-DP-1")).unwrap();

        let mut provider = SysfsProvider::new(root.path());
        let devices = provider.sample().unwrap();
        assert_eq!(devices.len(), 1);
        let metrics = &devices[0];
        assert_eq!(metrics.utilization_pct, Some(73.0));
        assert_eq!(metrics.memory_utilization_pct, Some(12.0));
        assert_eq!(metrics.memory_used_mib, Some(1024.0));
        assert_eq!(metrics.memory_total_mib, Some(8192.0));
        assert_eq!(metrics.sm_clock_mhz, Some(1800.0));
        assert_eq!(metrics.memory_clock_mhz, Some(1000.0));
        assert_eq!(metrics.temperature_c, Some(54.0));
        assert_eq!(metrics.power_w, Some(118.0));
    }

    #[test]
    fn cards_without_metrics_are_ignored() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("card1/device")).unwrap();
        let mut provider = SysfsProvider::new(root.path());
        let err = provider.sample().unwrap_err();
        assert!(matches!(err, MetricsSourceError::NoDevices(_)));
    }

    #[test]
    fn missing_root_is_unavailable() {
        let root = TempDir::new().unwrap();
        let mut provider = SysfsProvider::new(root.path().join("absent"));
        let err = provider.sample().unwrap_err();
        assert!(matches!(err, MetricsSourceError::Unavailable { .. }));
    }

    #[test]
    fn orders_cards_numerically() {
        let root = TempDir::new().unwrap();
        let second = fake_card(root.path(), "card10");
        fs::write(second.join("gpu_busy_percent"), "5\n").unwrap();
        fake_card(root.path(), "card2");

        let devices = SysfsProvider::new(root.path()).sample().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].utilization_pct, Some(73.0));
        assert_eq!(devices[1].utilization_pct, Some(5.0));
    }

    #[test]
    fn parses_clock_lines() {
        assert_eq!(parse_clock_line("1: 1800Mhz *"), Some(1800.0));
        assert_eq!(parse_clock_line("2: 875MHz *"), Some(875.0));
        assert_eq!(parse_clock_line("garbage"), None);
    }
}
