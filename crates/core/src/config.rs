// crates/core/src/config.rs
//! Runtime configuration: defaults, optional TOML file, environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::JobType;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_PORT: u16 = 47900;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaqConfig {
    pub scheduler: SchedulerConfig,
    pub hub: HubConfig,
    pub executor: ExecutorConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events retained per channel for late subscribers.
    pub buffer_size: usize,
    pub heartbeat_secs: u64,
    /// Subscriptions that see no job event for this long are closed.
    pub idle_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::hub::DEFAULT_BUFFER_SIZE,
            heartbeat_secs: 15,
            idle_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub program: String,
    /// Arguments passed to every job. `{source}`, `{tmp_dir}` and `{tmp_id}`
    /// are substituted.
    pub args: Vec<String>,
    /// Extra arguments per job type, appended after `args`.
    pub type_args: HashMap<JobType, Vec<String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let type_args = HashMap::from([
            (
                JobType::Best,
                vec!["-f".to_string(), "bestvideo*+bestaudio/best".to_string()],
            ),
            (
                JobType::Audio,
                vec!["-x".to_string(), "--audio-format".to_string(), "mp3".to_string()],
            ),
            (JobType::Clip, vec!["-f".to_string(), "best[height<=720]".to_string()]),
            (
                JobType::Convert,
                vec!["--recode-video".to_string(), "mp4".to_string()],
            ),
            (
                JobType::EmbedSubs,
                vec!["--write-subs".to_string(), "--embed-subs".to_string()],
            ),
        ]);
        Self {
            program: "yt-dlp".to_string(),
            args: vec![
                "--newline".to_string(),
                "--no-playlist".to_string(),
                "-o".to_string(),
                "{tmp_dir}/{tmp_id}.%(ext)s".to_string(),
                "{source}".to_string(),
            ],
            type_args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub tmp_dir: PathBuf,
    /// Terminal jobs and their unconsumed outputs are reaped after this long.
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            retention_secs: 3600,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

fn default_tmp_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediaq")
}

impl MediaqConfig {
    /// Read a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// `MEDIAQ_PORT` (or `PORT`), `MEDIAQ_MAX_CONCURRENT`, `MEDIAQ_EXECUTOR`,
    /// `MEDIAQ_TMP_DIR`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some((key, value)) = ["MEDIAQ_PORT", "PORT"]
            .iter()
            .find_map(|k| lookup(k).map(|v| (*k, v)))
        {
            self.server.port = parse_env(key, &value)?;
        }
        if let Some(value) = lookup("MEDIAQ_MAX_CONCURRENT") {
            self.scheduler.max_concurrent = parse_env("MEDIAQ_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = lookup("MEDIAQ_EXECUTOR") {
            self.executor.program = value;
        }
        if let Some(value) = lookup("MEDIAQ_TMP_DIR") {
            self.storage.tmp_dir = PathBuf::from(value);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MediaqConfig::default();
        assert_eq!(config.scheduler.max_concurrent, 3);
        assert_eq!(config.hub.buffer_size, 50);
        assert_eq!(config.hub.idle_timeout_secs, 600);
        assert_eq!(config.executor.program, "yt-dlp");
        for ty in JobType::ALL {
            assert!(config.executor.type_args.contains_key(&ty), "missing args for {ty}");
        }
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MediaqConfig::from_toml(
            r#"
            [scheduler]
            max_concurrent = 6

            [executor.type_args]
            audio = ["-x"]
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent, 6);
        assert_eq!(config.hub.heartbeat_secs, 15);
        assert_eq!(config.executor.type_args.get(&JobType::Audio), Some(&vec!["-x".to_string()]));
        assert_eq!(config.executor.program, "yt-dlp");
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler\nmax_concurrent = ").unwrap();
        let err = MediaqConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_file_missing() {
        let err = MediaqConfig::from_file(Path::new("/nonexistent/mediaq.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("PORT", "8080"),
            ("MEDIAQ_MAX_CONCURRENT", "7"),
            ("MEDIAQ_EXECUTOR", "/usr/local/bin/yt-dlp"),
            ("MEDIAQ_TMP_DIR", "/var/tmp/mq"),
        ]);
        let mut config = MediaqConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scheduler.max_concurrent, 7);
        assert_eq!(config.executor.program, "/usr/local/bin/yt-dlp");
        assert_eq!(config.storage.tmp_dir, PathBuf::from("/var/tmp/mq"));
    }

    #[test]
    fn test_mediaq_port_wins_over_port() {
        let env = HashMap::from([("PORT", "8080"), ("MEDIAQ_PORT", "9090")]);
        let mut config = MediaqConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = MediaqConfig::default();
        let err = config
            .apply_env(|k| (k == "MEDIAQ_MAX_CONCURRENT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
