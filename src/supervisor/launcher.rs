use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};

use crate::config::BackendConfig;

/// Forces an unbuffered, UTF-8 text stream out of the Python backend whatever the host locale
pub const UNBUFFERED_UTF8_ENV: [(&str, &str); 3] = [
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
];

#[cfg(target_os = "windows")]
const WINDOWS_CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Backend executable not found at: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to spawn backend {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Build the command starting the backend: run from its own directory, every standard stream
/// piped, no console window.
pub fn backend_command(executable: &Path, config: &BackendConfig) -> Command {
    let mut command = Command::new(executable);
    command
        .args(&config.args)
        .envs(UNBUFFERED_UTF8_ENV)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = executable.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        command.creation_flags(WINDOWS_CREATE_NO_WINDOW);
    }

    command
}

pub fn spawn_backend(executable: &Path, config: &BackendConfig) -> Result<Child, LaunchError> {
    if !executable.exists() {
        return Err(LaunchError::NotFound(executable.to_path_buf()));
    }

    backend_command(executable, config)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            path: executable.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_is_not_spawned() {
        let missing = Path::new("/definitely/not/here/Mihari backend");
        let err = spawn_backend(missing, &BackendConfig::default()).unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(ref path) if path == missing));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn command_runs_from_executable_directory_with_overrides() {
        let mut config = BackendConfig::default();
        config.args = vec!["--port".to_string(), "8153".to_string()];
        config
            .env
            .insert("MIHARI_DATA".to_string(), "/tmp/mihari".to_string());

        let command = backend_command(Path::new("/opt/mihari/backend"), &config);
        let std_command = command.as_std();

        assert_eq!(
            std_command.get_current_dir(),
            Some(Path::new("/opt/mihari"))
        );
        assert_eq!(
            std_command.get_args().collect::<Vec<_>>(),
            vec!["--port", "8153"]
        );
        let envs: Vec<_> = std_command
            .get_envs()
            .filter_map(|(key, value)| Some((key.to_str()?, value?.to_str()?)))
            .collect();
        for (key, value) in UNBUFFERED_UTF8_ENV {
            assert!(envs.contains(&(key, value)), "missing {key}={value}");
        }
        assert!(envs.contains(&("MIHARI_DATA", "/tmp/mihari")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_file_fails_to_spawn() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = spawn_backend(file.path(), &BackendConfig::default()).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
