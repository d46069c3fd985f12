use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use revbot_engine::MirrorConfig;
use revbot_terminal_metatrader::MetaTraderConfig;
use rust_decimal::Decimal;
use serde::Deserialize;

/// TOML configuration file. Every field has a default so a partial file
/// (or none at all) works.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub mirror: MirrorSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerminalSection {
    pub host: String,
    pub port: u16,
    pub reconnect_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for TerminalSection {
    fn default() -> Self {
        let defaults = MetaTraderConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            reconnect_interval_secs: defaults.reconnect_interval_secs,
            heartbeat_interval_secs: defaults.heartbeat_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorSection {
    pub magic: i64,
    pub comment_prefix: String,
    pub deviation_points: u32,
    pub poll_interval_ms: u64,
    pub volume_multiplier: Decimal,
}

impl Default for MirrorSection {
    fn default() -> Self {
        let defaults = MirrorConfig::default();
        Self {
            magic: defaults.magic,
            comment_prefix: defaults.comment_prefix,
            deviation_points: defaults.deviation_points,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            volume_multiplier: defaults.volume_multiplier,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Cannot parse config file {}", path.display()))
    }

    pub fn terminal_config(&self) -> MetaTraderConfig {
        MetaTraderConfig {
            host: self.terminal.host.clone(),
            port: self.terminal.port,
            reconnect_interval_secs: self.terminal.reconnect_interval_secs,
            heartbeat_interval_secs: self.terminal.heartbeat_interval_secs,
        }
    }

    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            magic: self.mirror.magic,
            comment_prefix: self.mirror.comment_prefix.clone(),
            deviation_points: self.mirror.deviation_points,
            poll_interval: Duration::from_millis(self.mirror.poll_interval_ms),
            volume_multiplier: self.mirror.volume_multiplier,
            ..MirrorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = FileConfig::default();
        let mirror = config.mirror_config();
        assert_eq!(mirror.magic, 987_654_321);
        assert_eq!(mirror.comment_prefix, "REV of ");
        assert_eq!(mirror.poll_interval, Duration::from_secs(1));
        assert_eq!(mirror.volume_multiplier, dec!(2));
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: FileConfig = toml::from_str(
            r#"
            [terminal]
            host = "10.0.0.5"

            [mirror]
            magic = 42
            volume_multiplier = "3"
            "#,
        )
        .unwrap();

        assert_eq!(config.terminal.host, "10.0.0.5");
        assert_eq!(config.terminal.port, MetaTraderConfig::default().port);

        let mirror = config.mirror_config();
        assert_eq!(mirror.magic, 42);
        assert_eq!(mirror.volume_multiplier, dec!(3));
        assert_eq!(mirror.deviation_points, 20);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str(
            r#"
            [mirror]
            magik = 42
            "#,
        );
        assert!(parsed.is_err());
    }
}
