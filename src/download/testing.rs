use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

/// Write an executable yt-dlp stand-in running `body`.
pub(crate) fn fake_yt_dlp(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("yt-dlp");
    let script = format!("#!/bin/sh\n[ \"$1\" = \"--ready-check\" ] && exit 0\n{body}\n");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    // A concurrently forked test may briefly hold the file open for writing (ETXTBSY)
    for _ in 0..50 {
        match std::process::Command::new(&path).arg("--ready-check").status() {
            Ok(_) => return path,
            Err(e) if e.raw_os_error() == Some(26) => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(e) => panic!("fake yt-dlp is not executable: {e}"),
        }
    }
    panic!("fake yt-dlp stayed busy");
}
