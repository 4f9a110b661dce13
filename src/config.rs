use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `BACKREST_SIDECAR_PORT=8082`.
pub const ENV_PREFIX: &str = "BACKREST_SIDECAR_";

/// Environment variable pgBackRest itself reads the stanza from.
pub const STANZA_ENV: &str = "PGBACKREST_STANZA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_address: IpAddr,
    pub port: u16,
    pub log_level: LogLevel,
    pub json_logs: bool,
    /// pgBackRest stanza every command is run against.
    pub stanza: String,
    pub pgbackrest_bin: PathBuf,
    /// Seconds between unprompted history refreshes.
    pub history_interval_secs: u64,
}

/// Everything except the stanza has a default.
#[derive(Serialize)]
struct Defaults {
    listen_address: IpAddr,
    port: u16,
    log_level: LogLevel,
    json_logs: bool,
    pgbackrest_bin: PathBuf,
    history_interval_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8081,
            log_level: LogLevel::Info,
            json_logs: false,
            pgbackrest_bin: PathBuf::from("pgbackrest"),
            history_interval_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the optional TOML file, the environment and finally
    /// the command line overrides.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Defaults::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file_exact(path));
        }

        figment = figment
            .merge(Env::raw().only(&[STANZA_ENV]).map(|_| "stanza".into()))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .context("Invalid configuration (is the stanza set?)")
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Cli {
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stanza: Option<String>,
    }

    #[test]
    fn defaults_apply_when_only_stanza_is_given() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(STANZA_ENV, "poddb");

            let config = AppConfig::new::<Cli>(None, None).unwrap();
            assert_eq!(config.stanza, "poddb");
            assert_eq!(config.port, 8081);
            assert_eq!(config.log_level, LogLevel::Info);
            assert_eq!(config.pgbackrest_bin, PathBuf::from("pgbackrest"));
            assert_eq!(config.history_interval(), Duration::from_secs(3600));
            Ok(())
        });
    }

    #[test]
    fn sidecar_env_beats_pgbackrest_env() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(STANZA_ENV, "from-pgbackrest-env");
            jail.set_env("BACKREST_SIDECAR_STANZA", "from-sidecar-env");

            let config = AppConfig::new::<Cli>(None, None).unwrap();
            assert_eq!(config.stanza, "from-sidecar-env");
            Ok(())
        });
    }

    #[test]
    fn missing_stanza_is_an_error() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            assert!(AppConfig::new::<Cli>(None, None).is_err());
            Ok(())
        });
    }

    #[test]
    fn layers_override_in_order() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "sidecar.toml",
                r#"
                    stanza = "from-file"
                    port = 9000
                    log_level = "debug"
                "#,
            )?;
            jail.set_env(STANZA_ENV, "from-pgbackrest-env");
            jail.set_env("BACKREST_SIDECAR_PORT", "9001");

            let file = Path::new("sidecar.toml");
            let config = AppConfig::new::<Cli>(Some(file), None).unwrap();
            assert_eq!(config.stanza, "from-pgbackrest-env");
            assert_eq!(config.port, 9001);
            assert_eq!(config.log_level, LogLevel::Debug);

            let cli = Cli {
                port: Some(9002),
                stanza: None,
            };
            let config = AppConfig::new(Some(file), Some(&cli)).unwrap();
            assert_eq!(config.port, 9002);
            assert_eq!(config.stanza, "from-pgbackrest-env");
            Ok(())
        });
    }
}
