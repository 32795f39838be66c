//! Configuration file of the sidecar.
//!
//! The file is TOML. Every key is optional; unknown keys are rejected.
//!
//! ```toml
//! agent_address = "/tmp/spire-agent/public/api.sock"
//! cmd = "nginx"
//! cmd_args = "-g \"daemon off;\""
//! renew_signal = "SIGHUP"
//! cert_dir = "/certs"
//! svid_file_name = "svid.pem"
//! svid_key_file_name = "svid_key.pem"
//! svid_bundle_file_name = "svid_bundle.pem"
//!
//! [[jwt_svids]]
//! jwt_audience = "spiffe://example.org/db"
//! jwt_svid_file_name = "db.token"
//!
//! [health_checks]
//! listener_enabled = true
//! ```

use crate::disk::{
    DiskConfig, DEFAULT_CERT_FILE_MODE, DEFAULT_JWT_BUNDLE_FILE_MODE, DEFAULT_JWT_SVID_FILE_MODE,
    DEFAULT_KEY_FILE_MODE,
};
use crate::health::server::HealthServerConfig;
use crate::process::{ProcessConfig, ProcessError, RenewSignal};
use crate::sidecar::{JwtSvidTarget, SidecarSettings};
use crate::workload_api::client::socket_path_from_address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default Workload API socket of a SPIRE agent.
pub const DEFAULT_AGENT_ADDRESS: &str = "/tmp/spire-agent/public/api.sock";
/// Default port of the health listener.
pub const DEFAULT_BIND_PORT: u16 = 8081;
/// Default liveness path.
pub const DEFAULT_LIVENESS_PATH: &str = "/live";
/// Default readiness path.
pub const DEFAULT_READINESS_PATH: &str = "/ready";

/// Errors that can arise loading or validating a [`Config`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        /// The config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown or mistyped keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Only some of the X.509 file names are set.
    #[error("all or none of 'svid_file_name', 'svid_key_file_name', 'svid_bundle_file_name' must be specified")]
    PartialX509Files,

    /// No credential kind is configured.
    #[error("at least one of the sets ('svid_file_name', 'svid_key_file_name', 'svid_bundle_file_name'), 'jwt_svids', or 'jwt_bundle_file_name' must be fully specified")]
    NothingEnabled,

    /// A `[[jwt_svids]]` entry misses a required key.
    #[error("jwt_svids[{index}]: '{key}' is required")]
    IncompleteJwtSvid {
        /// Position of the entry.
        index: usize,
        /// The missing key.
        key: &'static str,
    },

    /// Two `[[jwt_svids]]` entries write the same file.
    #[error("jwt_svids: duplicate jwt_svid_file_name {0}")]
    DuplicateJwtSvidFile(String),

    /// A PID file is configured without a signal to send.
    #[error("must specify renew_signal when using pid_file_name")]
    RenewSignalRequired,

    /// Arguments are configured without a command.
    #[error("cmd_args requires cmd")]
    CmdArgsWithoutCmd,

    /// The renewal signal is unknown.
    #[error("invalid renew_signal: {0}")]
    RenewSignal(#[source] ProcessError),

    /// A file mode has bits beyond the permission bits.
    #[error("invalid {key}: {mode:o}")]
    InvalidFileMode {
        /// The offending key.
        key: &'static str,
        /// The configured mode.
        mode: u32,
    },

    /// The agent address is not a Unix socket.
    #[error("invalid agent_address: {0}")]
    AgentAddress(String),

    /// A health check path does not start with `/`.
    #[error("health_checks: {key} must start with '/'")]
    InvalidHealthPath {
        /// The offending key.
        key: &'static str,
    },
}

/// One `[[jwt_svids]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtSvidConfig {
    /// Audience of the JWT SVID.
    #[serde(default)]
    pub jwt_audience: String,
    /// Additional audiences requested with the same SVID.
    #[serde(default)]
    pub jwt_extra_audiences: Vec<String>,
    /// File name of the token in `cert_dir`.
    #[serde(default)]
    pub jwt_svid_file_name: String,
}

/// The `[health_checks]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthChecks {
    /// Starts the HTTP listener.
    pub listener_enabled: bool,
    /// Port of the listener.
    pub bind_port: u16,
    /// Path of the liveness probe.
    pub liveness_path: String,
    /// Path of the readiness probe.
    pub readiness_path: String,
}

impl Default for HealthChecks {
    fn default() -> Self {
        Self {
            listener_enabled: false,
            bind_port: DEFAULT_BIND_PORT,
            liveness_path: DEFAULT_LIVENESS_PATH.to_owned(),
            readiness_path: DEFAULT_READINESS_PATH.to_owned(),
        }
    }
}

/// The sidecar configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Workload API address.
    #[serde(default = "default_agent_address")]
    pub agent_address: String,
    /// Command spawned on the first X.509 update and signalled afterwards.
    #[serde(default)]
    pub cmd: Option<String>,
    /// Argument string of `cmd`.
    #[serde(default)]
    pub cmd_args: Option<String>,
    /// File holding the PID of a process to signal after each X.509 update.
    #[serde(default)]
    pub pid_file_name: Option<PathBuf>,
    /// Directory credentials are written to.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Mode of certificate and bundle files.
    #[serde(default = "default_cert_file_mode")]
    pub cert_file_mode: u32,
    /// Mode of the private key file.
    #[serde(default = "default_key_file_mode")]
    pub key_file_mode: u32,
    /// Mode of the JWT bundle file.
    #[serde(default = "default_jwt_bundle_file_mode")]
    pub jwt_bundle_file_mode: u32,
    /// Mode of JWT SVID files.
    #[serde(default = "default_jwt_svid_file_mode")]
    pub jwt_svid_file_mode: u32,
    /// Moves intermediates from the SVID file into the bundle file.
    #[serde(default)]
    pub add_intermediates_to_bundle: bool,
    /// Appends federated bundles to the bundle file.
    #[serde(default)]
    pub include_federated_domains: bool,
    /// Signal sent to the child or PID-file process after renewal.
    #[serde(default)]
    pub renew_signal: Option<String>,
    /// Keeps running and renewing; `false` fetches once and exits.
    #[serde(default)]
    pub daemon_mode: Option<bool>,
    /// Health listener settings.
    #[serde(default)]
    pub health_checks: HealthChecks,
    /// Selects the X.509 SVID with this hint instead of the default one.
    #[serde(default)]
    pub hint: Option<String>,
    /// Number of concurrent fetch cycles (0 uses streaming watches in daemon mode).
    #[serde(default)]
    pub parallel_requests: usize,
    /// File name of the X.509 SVID certificate chain.
    #[serde(default)]
    pub svid_file_name: Option<String>,
    /// File name of the X.509 SVID private key.
    #[serde(default)]
    pub svid_key_file_name: Option<String>,
    /// File name of the X.509 trust bundle.
    #[serde(default)]
    pub svid_bundle_file_name: Option<String>,
    /// File name of the JWT bundle set.
    #[serde(default)]
    pub jwt_bundle_file_name: Option<String>,
    /// JWT SVIDs to maintain.
    #[serde(default)]
    pub jwt_svids: Vec<JwtSvidConfig>,
}

fn default_agent_address() -> String {
    DEFAULT_AGENT_ADDRESS.to_owned()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_cert_file_mode() -> u32 {
    DEFAULT_CERT_FILE_MODE
}

fn default_key_file_mode() -> u32 {
    DEFAULT_KEY_FILE_MODE
}

fn default_jwt_bundle_file_mode() -> u32 {
    DEFAULT_JWT_BUNDLE_FILE_MODE
}

fn default_jwt_svid_file_mode() -> u32 {
    DEFAULT_JWT_SVID_FILE_MODE
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl Config {
    /// Reads and parses the file at `path`. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        content.parse()
    }

    /// Checks the cross-key rules of the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        socket_path_from_address(&self.agent_address)
            .map_err(|e| ConfigError::AgentAddress(e.to_string()))?;

        let x509_set = [
            &self.svid_file_name,
            &self.svid_key_file_name,
            &self.svid_bundle_file_name,
        ]
        .into_iter()
        .filter(|name| non_empty(name).is_some())
        .count();
        if x509_set != 0 && x509_set != 3 {
            return Err(ConfigError::PartialX509Files);
        }

        if !self.x509_enabled() && !self.jwt_bundle_enabled() && !self.jwt_svids_enabled() {
            return Err(ConfigError::NothingEnabled);
        }

        let mut seen = std::collections::HashSet::new();
        for (index, entry) in self.jwt_svids.iter().enumerate() {
            if entry.jwt_audience.is_empty() {
                return Err(ConfigError::IncompleteJwtSvid {
                    index,
                    key: "jwt_audience",
                });
            }
            if entry.jwt_svid_file_name.is_empty() {
                return Err(ConfigError::IncompleteJwtSvid {
                    index,
                    key: "jwt_svid_file_name",
                });
            }
            if !seen.insert(entry.jwt_svid_file_name.as_str()) {
                return Err(ConfigError::DuplicateJwtSvidFile(
                    entry.jwt_svid_file_name.clone(),
                ));
            }
        }

        if non_empty(&self.cmd_args).is_some() && non_empty(&self.cmd).is_none() {
            return Err(ConfigError::CmdArgsWithoutCmd);
        }
        if self.pid_file_name.is_some() && non_empty(&self.renew_signal).is_none() {
            return Err(ConfigError::RenewSignalRequired);
        }
        self.renew_signal()?;

        for (key, mode) in [
            ("cert_file_mode", self.cert_file_mode),
            ("key_file_mode", self.key_file_mode),
            ("jwt_bundle_file_mode", self.jwt_bundle_file_mode),
            ("jwt_svid_file_mode", self.jwt_svid_file_mode),
        ] {
            if mode > 0o777 {
                return Err(ConfigError::InvalidFileMode { key, mode });
            }
        }

        let health = &self.health_checks;
        if !health.liveness_path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath {
                key: "liveness_path",
            });
        }
        if !health.readiness_path.starts_with('/') {
            return Err(ConfigError::InvalidHealthPath {
                key: "readiness_path",
            });
        }

        Ok(())
    }

    /// Returns `true` when all X.509 file names are set.
    pub fn x509_enabled(&self) -> bool {
        non_empty(&self.svid_file_name).is_some()
            && non_empty(&self.svid_key_file_name).is_some()
            && non_empty(&self.svid_bundle_file_name).is_some()
    }

    /// Returns `true` when the JWT bundle file name is set.
    pub fn jwt_bundle_enabled(&self) -> bool {
        non_empty(&self.jwt_bundle_file_name).is_some()
    }

    /// Returns `true` when at least one JWT SVID is configured.
    pub fn jwt_svids_enabled(&self) -> bool {
        !self.jwt_svids.is_empty()
    }

    /// Returns the effective daemon mode (defaults to `true`).
    pub fn daemon_mode(&self) -> bool {
        self.daemon_mode.unwrap_or(true)
    }

    /// Parses the renewal signal, if configured.
    pub fn renew_signal(&self) -> Result<Option<RenewSignal>, ConfigError> {
        non_empty(&self.renew_signal)
            .map(|signal| signal.parse().map_err(ConfigError::RenewSignal))
            .transpose()
    }

    fn path_string(&self, file_name: &str) -> String {
        self.cert_dir.join(file_name).to_string_lossy().into_owned()
    }

    /// Builds the engine settings.
    pub fn sidecar_settings(&self) -> SidecarSettings {
        SidecarSettings {
            x509_enabled: self.x509_enabled(),
            hint: non_empty(&self.hint).map(str::to_owned),
            jwt_bundle_path: non_empty(&self.jwt_bundle_file_name)
                .map(|name| self.path_string(name)),
            jwt_svids: self
                .jwt_svids
                .iter()
                .map(|entry| JwtSvidTarget {
                    audience: entry.jwt_audience.clone(),
                    extra_audiences: entry.jwt_extra_audiences.clone(),
                    file_name: entry.jwt_svid_file_name.clone(),
                    path: self.path_string(&entry.jwt_svid_file_name),
                })
                .collect(),
            parallel_requests: self.parallel_requests,
            daemon_mode: self.daemon_mode(),
        }
    }

    /// Builds the disk writer settings.
    pub fn disk_config(&self) -> DiskConfig {
        DiskConfig {
            cert_dir: self.cert_dir.clone(),
            svid_file_name: non_empty(&self.svid_file_name).map(str::to_owned),
            svid_key_file_name: non_empty(&self.svid_key_file_name).map(str::to_owned),
            svid_bundle_file_name: non_empty(&self.svid_bundle_file_name).map(str::to_owned),
            jwt_bundle_file_name: non_empty(&self.jwt_bundle_file_name).map(str::to_owned),
            cert_file_mode: self.cert_file_mode,
            key_file_mode: self.key_file_mode,
            jwt_bundle_file_mode: self.jwt_bundle_file_mode,
            jwt_svid_file_mode: self.jwt_svid_file_mode,
            add_intermediates_to_bundle: self.add_intermediates_to_bundle,
            include_federated_domains: self.include_federated_domains,
        }
    }

    /// Builds the process side channel settings.
    pub fn process_config(&self) -> Result<ProcessConfig, ConfigError> {
        Ok(ProcessConfig {
            cmd: non_empty(&self.cmd).map(str::to_owned),
            cmd_args: self.cmd_args.clone().unwrap_or_default(),
            pid_file_name: self.pid_file_name.clone(),
            renew_signal: self.renew_signal()?,
            inherit_stdio: true,
        })
    }

    /// Returns the health listener settings when the listener is enabled.
    pub fn health_server_config(&self) -> Option<HealthServerConfig> {
        let health = &self.health_checks;
        health.listener_enabled.then(|| HealthServerConfig {
            bind_port: health.bind_port,
            liveness_path: health.liveness_path.clone(),
            readiness_path: health.readiness_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    const FULL: &str = r#"
        agent_address = "unix:///run/spire/agent.sock"
        cmd = "nginx"
        cmd_args = "-g \"daemon off;\""
        cert_dir = "/certs"
        cert_file_mode = 0o640
        renew_signal = "SIGHUP"
        hint = "internal"
        svid_file_name = "svid.pem"
        svid_key_file_name = "svid_key.pem"
        svid_bundle_file_name = "svid_bundle.pem"
        jwt_bundle_file_name = "bundle.json"

        [[jwt_svids]]
        jwt_audience = "spiffe://example.org/db"
        jwt_extra_audiences = ["extra"]
        jwt_svid_file_name = "db.token"

        [health_checks]
        listener_enabled = true
        bind_port = 9090
    "#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = FULL.parse().unwrap();
        config.validate().unwrap();

        assert!(config.x509_enabled());
        assert!(config.jwt_bundle_enabled());
        assert!(config.daemon_mode());
        assert_eq!(config.cert_file_mode, 0o640);
        assert_eq!(config.key_file_mode, 0o600);

        let settings = config.sidecar_settings();
        assert_eq!(settings.hint.as_deref(), Some("internal"));
        assert_eq!(settings.jwt_bundle_path.as_deref(), Some("/certs/bundle.json"));
        assert_eq!(settings.jwt_svids[0].path, "/certs/db.token");
        assert_eq!(settings.jwt_svids[0].extra_audiences, vec!["extra"]);

        let process = config.process_config().unwrap();
        assert_eq!(process.cmd.as_deref(), Some("nginx"));
        assert_eq!(process.cmd_args, "-g \"daemon off;\"");
        assert_eq!(process.renew_signal.map(RenewSignal::signal), Some(Signal::SIGHUP));

        let health = config.health_server_config().unwrap();
        assert_eq!(health.bind_port, 9090);
        assert_eq!(health.liveness_path, "/live");
        assert_eq!(health.readiness_path, "/ready");
    }

    #[test]
    fn test_defaults() {
        let config: Config = r#"jwt_bundle_file_name = "bundle.json""#.parse().unwrap();
        config.validate().unwrap();

        assert_eq!(config.agent_address, DEFAULT_AGENT_ADDRESS);
        assert_eq!(config.cert_file_mode, 0o644);
        assert_eq!(config.jwt_svid_file_mode, 0o600);
        assert!(config.daemon_mode());
        assert!(!config.x509_enabled());
        assert!(config.health_server_config().is_none());
        assert_eq!(config.parallel_requests, 0);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(matches!(
            "svid_file = \"x\"".parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            "[health_checks]\nport = 1".parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }

    fn invalid(toml: &str) -> ConfigError {
        toml.parse::<Config>().unwrap().validate().unwrap_err()
    }

    #[test]
    fn test_validation_rules() {
        assert!(matches!(invalid(""), ConfigError::NothingEnabled));
        assert!(matches!(
            invalid(r#"svid_file_name = "svid.pem""#),
            ConfigError::PartialX509Files
        ));
        assert!(matches!(
            invalid("[[jwt_svids]]\njwt_svid_file_name = \"a.token\""),
            ConfigError::IncompleteJwtSvid { index: 0, key: "jwt_audience" }
        ));
        assert!(matches!(
            invalid("[[jwt_svids]]\njwt_audience = \"aud\""),
            ConfigError::IncompleteJwtSvid { index: 0, key: "jwt_svid_file_name" }
        ));
        assert!(matches!(
            invalid(
                "[[jwt_svids]]\njwt_audience = \"a\"\njwt_svid_file_name = \"t\"\n\
                 [[jwt_svids]]\njwt_audience = \"b\"\njwt_svid_file_name = \"t\""
            ),
            ConfigError::DuplicateJwtSvidFile(_)
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\npid_file_name = \"/run/app.pid\""),
            ConfigError::RenewSignalRequired
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\ncmd_args = \"-v\""),
            ConfigError::CmdArgsWithoutCmd
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\nrenew_signal = \"SIGNOPE\""),
            ConfigError::RenewSignal(_)
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\nkey_file_mode = 0o4777"),
            ConfigError::InvalidFileMode { key: "key_file_mode", .. }
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\nagent_address = \"tcp://127.0.0.1:1\""),
            ConfigError::AgentAddress(_)
        ));
        assert!(matches!(
            invalid("jwt_bundle_file_name = \"b\"\n[health_checks]\nliveness_path = \"live\""),
            ConfigError::InvalidHealthPath { key: "liveness_path" }
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.conf");
        std::fs::write(&path, "daemon_mode = false\njwt_bundle_file_name = \"b.json\"").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(!config.daemon_mode());

        assert!(matches!(
            Config::from_file(dir.path().join("missing.conf")),
            Err(ConfigError::Read { .. })
        ));
    }
}
