//! Profile configuration file support
//!
//! Profiles live in `~/.relayport/profiles.yaml` (or a file given with
//! `--config`). Each profile names a session broker, where its credentials
//! come from, friendly target names, and optional channel tuning.

use anyhow::{Context, Result};
use relayport_session::{ChannelConfig, ForwardingMode, StaticResolver};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PROFILE: &str = "default";

/// Top-level profiles file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Base URL of the session broker API
    pub broker_url: Option<String>,

    /// Environment variable holding the broker credentials
    pub credentials_env: Option<String>,

    /// Fixed stream URL; skips the broker and connects straight to an agent
    pub stream_url: Option<String>,

    /// Friendly target names mapped to target ids
    #[serde(default)]
    pub targets: BTreeMap<String, String>,

    #[serde(default)]
    pub tuning: Tuning,
}

/// Channel overrides; anything unset keeps the built-in default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    pub max_frame_size: Option<usize>,
    pub max_window: Option<usize>,
    pub retransmit_interval_ms: Option<u64>,
    pub retransmit_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub ack_delay_ms: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub mode: Option<ForwardingMode>,
}

impl Tuning {
    pub fn apply(&self, mut config: ChannelConfig) -> ChannelConfig {
        if let Some(size) = self.max_frame_size {
            config.max_frame_size = size;
        }
        if let Some(window) = self.max_window {
            config.max_window = window;
        }
        if let Some(ms) = self.retransmit_interval_ms {
            config.retransmit_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.retransmit_timeout_ms {
            config.retransmit_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.ack_delay_ms {
            config.ack_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        config
    }
}

impl Profile {
    pub fn resolver(&self) -> StaticResolver {
        self.targets
            .iter()
            .fold(StaticResolver::default(), |resolver, (name, id)| {
                resolver.with_target(name.clone(), id.clone())
            })
    }

    /// Read the broker credentials from the configured environment variable
    pub fn credentials(&self) -> Result<Option<String>> {
        match &self.credentials_env {
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("Credentials variable {} is not set", var)),
            None => Ok(None),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        self.tuning.apply(ChannelConfig::default())
    }
}

impl ProfileFile {
    /// `~/.relayport/profiles.yaml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".relayport").join("profiles.yaml"))
    }

    /// Load an explicit file, or the default file if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::default_path()?;
                if !path.exists() {
                    debug!("No profiles file at {:?}, using defaults", path);
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profiles file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid profiles file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML profiles")
    }

    /// Look up a profile; the default profile may be absent
    pub fn profile(&self, name: &str) -> Result<Profile> {
        match self.profiles.get(name) {
            Some(profile) => Ok(profile.clone()),
            None if name == DEFAULT_PROFILE => Ok(Profile::default()),
            None => anyhow::bail!(
                "Unknown profile '{}' (known: {})",
                name,
                self.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

/// Pick the profile name: explicit choice, then `AWS_PROFILE`, then the default
pub fn effective_profile(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("AWS_PROFILE").ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayport_session::{RemoteTargetId, TargetResolver};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
profiles:
  default:
    broker_url: "https://broker.example.com"
    credentials_env: RELAYPORT_TEST_CREDENTIALS
    targets:
      jenkins: i-0aaa111
  lab:
    stream_url: "tcp://10.0.0.5:7000"
    tuning:
      max_frame_size: 4096
      max_window: 65536
      retransmit_timeout_ms: 500
      mode: single
"#;

    #[test]
    fn test_parse_profiles() {
        let file = ProfileFile::parse(SAMPLE).unwrap();
        assert_eq!(file.profiles.len(), 2);

        let default = file.profile("default").unwrap();
        assert_eq!(
            default.broker_url.as_deref(),
            Some("https://broker.example.com")
        );
        assert_eq!(default.targets["jenkins"], "i-0aaa111");
        assert_eq!(default.tuning, Tuning::default());

        let lab = file.profile("lab").unwrap();
        assert_eq!(lab.stream_url.as_deref(), Some("tcp://10.0.0.5:7000"));
        assert!(lab.broker_url.is_none());
    }

    #[test]
    fn test_tuning_overrides_defaults() {
        let file = ProfileFile::parse(SAMPLE).unwrap();
        let config = file.profile("lab").unwrap().channel_config();
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.max_window, 65536);
        assert_eq!(config.retransmit_timeout, Duration::from_millis(500));
        assert_eq!(config.mode, ForwardingMode::Single);
        // Untouched values keep their defaults
        assert_eq!(config.max_retries, ChannelConfig::default().max_retries);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_profile() {
        let file = ProfileFile::parse(SAMPLE).unwrap();
        let err = file.profile("prod").unwrap_err().to_string();
        assert!(err.contains("prod"));
        assert!(err.contains("lab"));

        // An empty file still has a usable default profile
        let empty = ProfileFile::default();
        assert!(empty.profile(DEFAULT_PROFILE).unwrap().broker_url.is_none());
    }

    #[test]
    fn test_unknown_tuning_key_rejected() {
        let yaml = r#"
profiles:
  default:
    tuning:
      max_windows: 10
"#;
        assert!(ProfileFile::parse(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let loaded = ProfileFile::load(Some(file.path())).unwrap();
        assert!(loaded.profiles.contains_key("lab"));

        let missing = file.path().with_extension("missing");
        assert!(ProfileFile::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_credentials_from_env() {
        let profile = Profile {
            credentials_env: Some("RELAYPORT_TEST_CREDENTIALS_SET".to_string()),
            ..Default::default()
        };
        std::env::set_var("RELAYPORT_TEST_CREDENTIALS_SET", "s3cret");
        assert_eq!(profile.credentials().unwrap().as_deref(), Some("s3cret"));

        let unset = Profile {
            credentials_env: Some("RELAYPORT_TEST_CREDENTIALS_UNSET".to_string()),
            ..Default::default()
        };
        assert!(unset.credentials().is_err());
        assert!(Profile::default().credentials().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_profile_targets_resolve() {
        let file = ProfileFile::parse(SAMPLE).unwrap();
        let resolver = file.profile("default").unwrap().resolver();
        assert_eq!(
            resolver.resolve("jenkins").await.unwrap(),
            RemoteTargetId("i-0aaa111".to_string())
        );
        assert!(resolver.resolve("unknown").await.is_err());
    }

    #[test]
    fn test_explicit_profile_wins() {
        assert_eq!(effective_profile(Some("lab".to_string())), "lab");
    }
}
