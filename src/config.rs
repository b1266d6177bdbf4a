use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use crate::prelude::*;
use nestify::nest;

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;
pub const DEFAULT_READY_SENTINELS: [&str; 2] = ["Application startup complete", "Uvicorn running"];
const DEFAULT_OUTPUT_PATH: &str = "~/Videos/Mihari";

nest! {
    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]*
    #[serde(default, rename_all = "kebab-case")]*
    /// Persistent configuration for the Mihari supervisor.
    ///
    /// Stored as YAML, typically at `~/.config/mihari/config.yaml`. Every key is optional and
    /// falls back to the defaults below, so an empty file is a valid configuration.
    pub struct MihariConfig {
        pub backend: pub struct BackendConfig {
            /// Backend executable started by `mihari serve`
            pub path: Option<PathBuf>,
            /// Extra arguments passed to the backend executable
            pub args: Vec<String>,
            pub startup_timeout_ms: u64,
            pub grace_period_ms: u64,
            /// Substrings of a stdout line that mark the backend as ready
            pub ready_sentinels: Vec<String>,
            /// Environment variables set on top of the unbuffered/UTF-8 overrides
            pub env: BTreeMap<String, String>,
        },
        pub download: pub struct DownloadConfig {
            pub yt_dlp_path: Option<PathBuf>,
            pub output_path: PathBuf,
        },
    }
}

impl Default for MihariConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            ready_sentinels: DEFAULT_READY_SENTINELS
                .iter()
                .map(|sentinel| sentinel.to_string())
                .collect(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: None,
            output_path: PathBuf::from(shellexpand::tilde(DEFAULT_OUTPUT_PATH).as_ref()),
        }
    }
}

impl BackendConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Get the path to the configuration file, following the XDG Base Directory Specification
/// at https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
///
/// If config_name is None, returns ~/.config/mihari/config.yaml (default)
/// If config_name is Some, returns ~/.config/mihari/{config_name}.yaml
fn get_configuration_file_path(config_name: Option<&str>) -> Result<PathBuf> {
    let config_dir = match env::var("XDG_CONFIG_HOME") {
        Ok(config_home) => PathBuf::from(config_home),
        Err(_) => {
            let home = env::var("HOME").context("Neither XDG_CONFIG_HOME nor HOME is set")?;
            PathBuf::from(home).join(".config")
        }
    };
    let config_dir = config_dir.join("mihari");

    Ok(match config_name {
        Some(name) => config_dir.join(format!("{name}.yaml")),
        None => config_dir.join("config.yaml"),
    })
}

impl MihariConfig {
    /// Load the configuration. If it does not exist, return a default configuration.
    pub fn load(config_name: Option<&str>) -> Result<Self> {
        let config_path = get_configuration_file_path(config_name)?;

        let mut config = match fs::read(&config_path) {
            Ok(config_str) => {
                let config: MihariConfig = serde_yaml::from_slice(&config_str).context(format!(
                    "Failed to parse Mihari config at {}",
                    config_path.display()
                ))?;
                debug!("Config loaded from {}", config_path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                MihariConfig::default()
            }
            Err(e) => bail!("Failed to load config: {e}"),
        };

        // A ~ may reach us unexpanded when the file was written by hand
        if let Some(path) = config.backend.path.take() {
            config.backend.path = Some(expand_tilde(path));
        }
        if let Some(path) = config.download.yt_dlp_path.take() {
            config.download.yt_dlp_path = Some(expand_tilde(path));
        }
        config.download.output_path = expand_tilde(config.download.output_path);

        Ok(config)
    }
}

fn expand_tilde(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(raw) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load_from(content: Option<&str>, config_name: Option<&str>) -> Result<MihariConfig> {
        let temp_dir = TempDir::new().unwrap();
        if let Some(content) = content {
            let dir = temp_dir.path().join("mihari");
            fs::create_dir_all(&dir).unwrap();
            let file_name = format!("{}.yaml", config_name.unwrap_or("config"));
            fs::write(dir.join(file_name), content).unwrap();
        }

        temp_env::with_vars(
            [
                ("XDG_CONFIG_HOME", Some(temp_dir.path().as_os_str())),
                ("HOME", Some(temp_dir.path().as_os_str())),
            ],
            || MihariConfig::load(config_name),
        )
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_from(None, None).unwrap();
        assert_eq!(config.backend, BackendConfig::default());
        assert_eq!(config.backend.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.backend.grace_period(), Duration::from_secs(2));
        assert_eq!(
            config.backend.ready_sentinels,
            vec!["Application startup complete", "Uvicorn running"]
        );
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config = load_from(
            Some(
                "backend:\n  path: /opt/mihari/backend\n  startup-timeout-ms: 5000\n  env:\n    MIHARI_PORT: \"8153\"\n",
            ),
            None,
        )
        .unwrap();

        assert_eq!(
            config.backend.path,
            Some(PathBuf::from("/opt/mihari/backend"))
        );
        assert_eq!(config.backend.startup_timeout_ms, 5000);
        assert_eq!(config.backend.grace_period_ms, DEFAULT_GRACE_PERIOD_MS);
        assert_eq!(
            config.backend.env.get("MIHARI_PORT").map(String::as_str),
            Some("8153")
        );
        assert_eq!(config.download.yt_dlp_path, None);
    }

    #[test]
    fn named_config_is_loaded_from_its_own_file() {
        let config = load_from(
            Some("download:\n  yt-dlp-path: /usr/local/bin/yt-dlp\n"),
            Some("portable"),
        )
        .unwrap();
        assert_eq!(
            config.download.yt_dlp_path,
            Some(PathBuf::from("/usr/local/bin/yt-dlp"))
        );
    }

    #[test]
    fn invalid_yaml_reports_the_path() {
        let err = load_from(Some("backend: [not, a, map"), None).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse Mihari config"));
    }
}
