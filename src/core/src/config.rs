use crate::error::{Error, Result};
use crate::location::{LocationFix, Provider};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";
pub const LOCATION_FILE: &str = "location.conf";
pub const MAX_CONFIG_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub filter: FilterConfig,
    pub channel: ChannelConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Allowlist,
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub mode: FilterMode,
    pub packages: Vec<String>,
    pub patterns: Vec<String>,
    pub skip_isolated: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Allowlist,
            packages: Vec::new(),
            patterns: Vec::new(),
            skip_isolated: true,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Keep serving the last value received.
    #[default]
    Retain,
    /// Fall back to pass-through.
    Disable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub on_disconnect: DisconnectPolicy,
    pub poll_interval_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            on_disconnect: DisconnectPolicy::Retain,
            poll_interval_ms: 1000,
            handshake_timeout_ms: 500,
        }
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(50, 60_000))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.clamp(50, 5_000))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub provider: bool,
    pub timestamps: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            provider: true,
            timestamps: true,
        }
    }
}

impl ModuleConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| Error::configuration(err.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse(&read_bounded(path.as_ref())?)
    }
}

/// Desired state as written to `location.conf` by the manager app.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct LocationConfig {
    pub enabled: bool,
    pub fix: LocationFix,
}

impl LocationConfig {
    /// Parses the `key=value` format. Unknown keys and unparsable values are
    /// skipped, the resulting fix is validated as a whole.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = LocationConfig {
            enabled: false,
            fix: LocationFix::new(0.0, 0.0),
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            let (key, value) = (key.trim(), value.trim());
            let fix = &mut config.fix;

            match key {
                "enabled" => config.enabled = value.parse::<i64>().map(|it| it != 0).unwrap_or(false),
                "lat" => set(&mut fix.latitude, value),
                "lng" => set(&mut fix.longitude, value),
                "altitude" => set(&mut fix.altitude, value),
                "accuracy" => set(&mut fix.accuracy, value),
                "speed" => set(&mut fix.speed, value),
                "bearing" => set(&mut fix.bearing, value),
                "provider" => {
                    if let Ok(provider) = Provider::from_str(value) {
                        fix.provider = provider
                    }
                }
                _ => {}
            }
        }

        config.fix = config.fix.validated()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse(&read_bounded(path.as_ref())?)
    }
}

fn set<T: FromStr>(target: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *target = parsed;
    }
}

fn read_bounded(path: &Path) -> Result<String> {
    let size = fs::metadata(path)?.len() as usize;
    if size > MAX_CONFIG_SIZE {
        return Err(Error::configuration(format!(
            "{} too large: {size} bytes",
            path.display()
        )));
    }

    Ok(fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ModuleConfig::parse("").unwrap();

        assert_eq!(config.filter.mode, FilterMode::Allowlist);
        assert!(config.filter.packages.is_empty());
        assert!(config.filter.skip_isolated);
        assert_eq!(config.channel.on_disconnect, DisconnectPolicy::Retain);
        assert_eq!(config.channel.poll_interval(), Duration::from_millis(1000));
        assert!(config.hooks.provider && config.hooks.timestamps);
    }

    #[test]
    fn parses_full_config() {
        let config = ModuleConfig::parse(
            r#"
            [filter]
            mode = "all"
            packages = ["com.example.maps"]
            patterns = ['^com\.example\..*']
            skip_isolated = false

            [channel]
            on_disconnect = "disable"
            poll_interval_ms = 10

            [hooks]
            provider = false
            "#,
        )
        .unwrap();

        assert_eq!(config.filter.mode, FilterMode::All);
        assert_eq!(config.filter.packages, ["com.example.maps"]);
        assert_eq!(config.filter.patterns.len(), 1);
        assert!(!config.filter.skip_isolated);
        assert_eq!(config.channel.on_disconnect, DisconnectPolicy::Disable);
        assert_eq!(config.channel.poll_interval(), Duration::from_millis(50));
        assert!(!config.hooks.provider);
        assert!(config.hooks.timestamps);
    }

    #[test]
    fn malformed_config_is_a_configuration_error() {
        let err = ModuleConfig::parse("[filter\nmode = 3").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = ModuleConfig::parse("[filter]\nmode = \"everything\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn parses_manager_location_file() {
        let config = LocationConfig::parse(
            "enabled=1\nlat=48.858370\nlng=2.294481\naccuracy=4.5\naltitude=35\nspeed=0\nbearing=-10\nhidedev=1\n",
        )
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.fix.latitude, 48.858370);
        assert_eq!(config.fix.longitude, 2.294481);
        assert_eq!(config.fix.accuracy, 4.5);
        assert_eq!(config.fix.altitude, 35.0);
        assert_eq!(config.fix.bearing, 350.0);
        assert_eq!(config.fix.provider, Provider::Gps);
    }

    #[test]
    fn location_file_skips_garbage_values() {
        let config = LocationConfig::parse("enabled=yes\nlat=abc\nlng=10\nprovider=network\nnoise").unwrap();

        assert!(!config.enabled);
        assert_eq!(config.fix.latitude, 0.0);
        assert_eq!(config.fix.longitude, 10.0);
        assert_eq!(config.fix.provider, Provider::Network);
    }

    #[test]
    fn location_file_rejects_implausible_fix() {
        assert!(LocationConfig::parse("enabled=1\nlat=123\nlng=0").is_err());
    }

    #[test]
    fn loads_from_disk_and_bounds_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[filter]\npackages = [\"com.example.maps\"]").unwrap();
        let config = ModuleConfig::load(file.path()).unwrap();
        assert_eq!(config.filter.packages, ["com.example.maps"]);

        let mut big = tempfile::NamedTempFile::new().unwrap();
        big.write_all(&vec![b'#'; MAX_CONFIG_SIZE + 1]).unwrap();
        assert!(matches!(
            ModuleConfig::load(big.path()),
            Err(Error::Configuration(_))
        ));

        assert!(matches!(
            ModuleConfig::load("/nonexistent/mockgps/config.toml"),
            Err(Error::Io(_))
        ));
    }
}
