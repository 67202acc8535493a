//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(clippy::derivable_impls)]

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::ledger::ResvStyle;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub instance: InstanceCfg,
    pub logging: Logging,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceCfg {
    pub name: String,
    // Timer intervals, in seconds.
    pub hold_interval: u64,
    pub setup_timeout: u64,
    pub setup_retry_interval: u64,
    pub setup_retry_count: u32,
    pub resolver_retry_interval: u64,
    pub adaptivity_interval: Option<u64>,
    pub tunnel_id_min: u16,
    pub tunnel_id_max: u16,
    pub resv_style: ResvStyle,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub file: LoggingFile,
    pub console: LoggingConsole,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFile {
    pub enabled: bool,
    pub dir: String,
    pub name: String,
    pub rotation: LoggingFileRotation,
    #[serde(flatten)]
    pub fmt: LoggingFmt,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConsole {
    pub enabled: bool,
    #[serde(flatten)]
    pub fmt: LoggingFmt,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingFmt {
    pub style: LoggingFmtStyle,
    pub colors: bool,
    pub show_thread_id: bool,
    pub show_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFileRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFmtStyle {
    Compact,
    Full,
    Json,
    Pretty,
}

// ===== impl Config =====

impl Config {
    const DFLT_FILEPATH: &'static str = "/etc/holo-rsvp.toml";

    pub fn load(config_file: Option<&str>) -> Config {
        let config_file = config_file.unwrap_or(Config::DFLT_FILEPATH);

        match std::fs::read_to_string(config_file) {
            Ok(config_str) => match Config::parse(&config_str) {
                Ok(config) => config,
                Err(error) => {
                    warn!(%error, "failed to parse configuration file");
                    Config::default()
                }
            },
            Err(error) => {
                warn!(
                    %error, path = %config_file,
                    "failed to load configuration file"
                );
                warn!("falling back to default configuration");
                Config::default()
            }
        }
    }

    pub fn parse(config_str: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(config_str)
    }
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    pub fn hold_interval(&self) -> Duration {
        Duration::from_secs(self.hold_interval)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout)
    }

    pub fn setup_retry_interval(&self) -> Duration {
        Duration::from_secs(self.setup_retry_interval)
    }

    pub fn resolver_retry_interval(&self) -> Duration {
        Duration::from_secs(self.resolver_retry_interval)
    }

    pub fn adaptivity_interval(&self) -> Option<Duration> {
        self.adaptivity_interval
            .filter(|interval| *interval != 0)
            .map(Duration::from_secs)
    }

    pub fn tunnel_id_range(&self) -> RangeInclusive<u16> {
        self.tunnel_id_min..=self.tunnel_id_max
    }
}

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            name: "main".to_owned(),
            hold_interval: 45,
            setup_timeout: 60,
            setup_retry_interval: 30,
            setup_retry_count: 5,
            resolver_retry_interval: 5,
            adaptivity_interval: None,
            tunnel_id_min: 1,
            tunnel_id_max: u16::MAX,
            resv_style: ResvStyle::SharedExplicit,
        }
    }
}

// ===== impl LoggingFile =====

impl Default for LoggingFile {
    fn default() -> LoggingFile {
        LoggingFile {
            enabled: false,
            dir: "/var/log".to_owned(),
            name: "holo-rsvp.log".to_owned(),
            rotation: Default::default(),
            fmt: Default::default(),
        }
    }
}

// ===== impl LoggingConsole =====

impl Default for LoggingConsole {
    fn default() -> LoggingConsole {
        LoggingConsole {
            enabled: true,
            fmt: Default::default(),
        }
    }
}

// ===== impl LoggingFmt =====

impl Default for LoggingFmt {
    fn default() -> LoggingFmt {
        LoggingFmt {
            style: LoggingFmtStyle::Full,
            colors: false,
            show_thread_id: false,
            show_source: false,
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.instance.hold_interval(), Duration::from_secs(45));
        assert_eq!(config.instance.setup_retry_count, 5);
        assert_eq!(config.instance.adaptivity_interval(), None);
        assert_eq!(config.instance.tunnel_id_range(), 1..=u16::MAX);
        assert_eq!(config.instance.resv_style, ResvStyle::SharedExplicit);
        assert!(config.logging.console.enabled);
    }

    #[test]
    fn overrides() {
        let config = Config::parse(
            r#"
            [instance]
            setup_retry_count = 2
            adaptivity_interval = 300
            resv_style = "FixedFilter"

            [logging.console]
            style = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.instance.setup_retry_count, 2);
        assert_eq!(
            config.instance.adaptivity_interval(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.instance.resv_style, ResvStyle::FixedFilter);
        assert!(matches!(
            config.logging.console.fmt.style,
            LoggingFmtStyle::Json
        ));
    }

    #[test]
    fn unknown_field() {
        assert!(Config::parse("[instance]\nbogus = 1\n").is_err());
    }
}
