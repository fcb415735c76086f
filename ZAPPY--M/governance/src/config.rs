use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{GovernanceError, GovernanceResult};

/// Environment variable consulted for a hex-encoded key before the key file.
pub const DEFAULT_KEY_ENV: &str = "ZAPPY_GOVERNANCE_KEY";

/// Locations of every record the governance core reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernancePaths {
    /// Mode mutex record.
    pub mutex_record: PathBuf,
    /// Training admission protocol state.
    pub protocol_state: PathBuf,
    /// Containment/override record.
    pub containment: PathBuf,
    /// Replay-protection baseline.
    pub telemetry_baseline: PathBuf,
    /// Latest telemetry snapshot published by the training loop.
    pub telemetry_snapshot: PathBuf,
    /// Append-only incident trail.
    pub incident_log: PathBuf,
    /// Append-only recovery trail.
    pub recovery_log: PathBuf,
    /// Operational JSON log.
    pub operational_log: PathBuf,
    /// Optional durable event log.
    pub event_log: Option<PathBuf>,
    /// Marker maintained by the process supervisor while training is alive.
    pub liveness_marker: PathBuf,
    /// Directory holding gate-status signal files.
    pub signals_dir: PathBuf,
    /// Hex-encoded shared secret.
    pub secret_key: PathBuf,
    /// Advisory lock serialising read-modify-write sequences.
    pub state_lock: PathBuf,
}

impl GovernancePaths {
    /// Derives the default layout beneath `root`.
    #[must_use]
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let state = root.join("state");
        let logs = root.join("logs");
        Self {
            mutex_record: state.join("mode_mutex.json"),
            protocol_state: state.join("protocol_state.json"),
            containment: state.join("containment.json"),
            telemetry_baseline: state.join("telemetry_baseline.json"),
            telemetry_snapshot: root.join("telemetry").join("latest_snapshot.json"),
            incident_log: logs.join("incidents.jsonl"),
            recovery_log: logs.join("recovery.jsonl"),
            operational_log: logs.join("governance.log.jsonl"),
            event_log: None,
            liveness_marker: root.join("run").join("training.alive"),
            signals_dir: root.join("signals"),
            secret_key: root.join("secrets").join("governance.key"),
            state_lock: state.join(".state.lock"),
        }
    }
}

/// Where the shared signing key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySettings {
    /// Environment variable that overrides the key file, if any.
    pub env_override: Option<String>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            env_override: Some(DEFAULT_KEY_ENV.to_string()),
        }
    }
}

/// Complete governance configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceConfig {
    /// Record locations.
    pub paths: GovernancePaths,
    /// Key source settings.
    pub key: KeySettings,
    /// Label written into mutex records and audit entries.
    pub source: String,
}

impl GovernanceConfig {
    /// Default configuration rooted at `root`.
    #[must_use]
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        Self {
            paths: GovernancePaths::rooted_at(root),
            key: KeySettings::default(),
            source: "governance".into(),
        }
    }

    /// Disables the environment key override (hermetic tests).
    #[must_use]
    pub fn without_key_env(mut self) -> Self {
        self.key.env_override = None;
        self
    }

    /// Enables a durable event log at the given path.
    #[must_use]
    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.event_log = Some(path.into());
        self
    }

    /// Loads configuration from a TOML file.
    ///
    /// Relative paths inside the document are resolved against `root` when
    /// given, otherwise against the directory holding the file.
    pub fn load(path: impl AsRef<Path>) -> GovernanceResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| GovernanceError::io(path, err))?;
        let document: ConfigDocument = toml::from_str(&raw)
            .map_err(|err| GovernanceError::Config(format!("parsing {}: {err}", path.display())))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        document.resolve(&base)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    paths: PathOverrides,
    #[serde(default)]
    key: KeyDocument,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathOverrides {
    mutex_record: Option<PathBuf>,
    protocol_state: Option<PathBuf>,
    containment: Option<PathBuf>,
    telemetry_baseline: Option<PathBuf>,
    telemetry_snapshot: Option<PathBuf>,
    incident_log: Option<PathBuf>,
    recovery_log: Option<PathBuf>,
    operational_log: Option<PathBuf>,
    event_log: Option<PathBuf>,
    liveness_marker: Option<PathBuf>,
    signals_dir: Option<PathBuf>,
    secret_key: Option<PathBuf>,
    state_lock: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyDocument {
    #[serde(default = "default_key_env")]
    env_override: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
}

impl Default for KeyDocument {
    fn default() -> Self {
        Self {
            env_override: default_key_env(),
            path: None,
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_key_env() -> Option<String> {
    Some(DEFAULT_KEY_ENV.to_string())
}

impl ConfigDocument {
    fn resolve(self, base: &Path) -> GovernanceResult<GovernanceConfig> {
        let root = match self.root {
            Some(root) if root.is_relative() => base.join(root),
            Some(root) => root,
            None => base.to_path_buf(),
        };
        let resolve = |candidate: PathBuf| {
            if candidate.is_relative() {
                root.join(candidate)
            } else {
                candidate
            }
        };

        let mut paths = GovernancePaths::rooted_at(&root);
        let overrides = self.paths;
        macro_rules! apply {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(value) = overrides.$field {
                    paths.$field = resolve(value);
                })+
            };
        }
        apply!(
            mutex_record,
            protocol_state,
            containment,
            telemetry_baseline,
            telemetry_snapshot,
            incident_log,
            recovery_log,
            operational_log,
            liveness_marker,
            signals_dir,
            state_lock,
        );
        paths.event_log = overrides.event_log.map(resolve);
        if let Some(key_path) = overrides.secret_key.or(self.key.path) {
            paths.secret_key = resolve(key_path);
        }

        let env_override = self.key.env_override.filter(|name| !name.trim().is_empty());
        let source = self.source.unwrap_or_else(|| "governance".into());
        if source.trim().is_empty() {
            return Err(GovernanceError::Config("source label must not be empty".into()));
        }

        Ok(GovernanceConfig {
            paths,
            key: KeySettings { env_override },
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_live_under_root() {
        let config = GovernanceConfig::rooted_at("/srv/agent");
        assert_eq!(
            config.paths.mutex_record,
            PathBuf::from("/srv/agent/state/mode_mutex.json")
        );
        assert_eq!(
            config.paths.telemetry_snapshot,
            PathBuf::from("/srv/agent/telemetry/latest_snapshot.json")
        );
        assert_eq!(config.key.env_override.as_deref(), Some(DEFAULT_KEY_ENV));
        assert!(config.without_key_env().key.env_override.is_none());
    }

    #[test]
    fn loads_overrides_relative_to_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("governance.toml");
        fs::write(
            &path,
            r#"
root = "deploy"
source = "gov-node-1"

[paths]
telemetry_snapshot = "/var/run/trainer/snapshot.json"
event_log = "logs/events.jsonl"

[key]
env_override = ""
path = "keys/shared.hex"
"#,
        )
        .unwrap();

        let config = GovernanceConfig::load(&path).unwrap();
        let root = dir.path().join("deploy");
        assert_eq!(config.source, "gov-node-1");
        assert_eq!(
            config.paths.telemetry_snapshot,
            PathBuf::from("/var/run/trainer/snapshot.json")
        );
        assert_eq!(config.paths.event_log, Some(root.join("logs/events.jsonl")));
        assert_eq!(config.paths.secret_key, root.join("keys/shared.hex"));
        assert_eq!(config.paths.containment, root.join("state/containment.json"));
        assert!(config.key.env_override.is_none());
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("governance.toml");
        fs::write(&path, "[paths]\nmystery = \"x\"\n").unwrap();
        assert!(matches!(
            GovernanceConfig::load(&path),
            Err(GovernanceError::Config(_))
        ));
    }
}
