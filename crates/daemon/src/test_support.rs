//! Fixtures shared by the executor, daemon and server tests: fake yt-dlp
//! and ffmpeg scripts plus a ready-to-run configuration.

use fetch_daemon_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Probe output of a single 720p clip titled "Alpha Clip"
pub(crate) const PROBE_CLIP: &str = r#"echo '{"title":"Alpha Clip","format_id":"22","width":1280,"height":720,"vcodec":"avc1.64001F","acodec":"mp4a.40.2","filesize":1048576}'"#;

/// Three progress bars, then the file named by the `-o` template
pub(crate) const DOWNLOAD_SINGLE: &str = r#"echo "[download]  10.0% of 1.00MiB"
echo "[download]  55.5% of 1.00MiB"
echo "[download] 100.0% of 1.00MiB"
file=$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')
printf data > "$file""#;

/// Three numbered segments next to the `-o` template
pub(crate) const DOWNLOAD_PLAYLIST: &str = r#"dir=$(dirname "$out")
for i in 1 2 3; do
  printf "seg$i" > "$dir/0000$i - part.mp4"
  echo "[download] 100.0% of 1.00MiB"
done"#;

/// Leaves a fragment behind and never finishes on its own
pub(crate) const DOWNLOAD_HANG: &str = r#"file=$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')
printf x > "$file.part"
echo "[download]   1.0% of 1.00MiB"
exec sleep 30"#;

pub(crate) const DOWNLOAD_FAIL: &str = r#"echo "ERROR: Video unavailable"
exit 1"#;

#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fake yt-dlp: runs `probe` for `--skip-download` calls, `download`
/// otherwise, with the `-o` template in `$out`.
#[cfg(unix)]
pub(crate) fn fake_ytdlp(dir: &Path, probe: &str, download: &str) -> PathBuf {
    let body = [
        "out=''",
        "probe=0",
        "while [ $# -gt 0 ]; do",
        "  case \"$1\" in",
        "    --skip-download) probe=1 ;;",
        "    -o) shift; out=\"$1\" ;;",
        "  esac",
        "  shift",
        "done",
        "if [ \"$probe\" = 1 ]; then",
        probe,
        "  exit 0",
        "fi",
        download,
    ]
    .join("\n");
    write_script(dir, "fake-yt-dlp", &body)
}

/// Fake ffmpeg writing "merged" to its last argument
#[cfg(unix)]
pub(crate) fn fake_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-ffmpeg",
        "for a in \"$@\"; do last=\"$a\"; done\nprintf merged > \"$last\"",
    )
}

/// Configured daemon settings with one library root and the given yt-dlp
pub(crate) fn test_config(library: &Path, ytdlp: &Path) -> Config {
    let mut config = Config::default();
    config.library.roots = vec![library.to_path_buf()];
    config.catalog.url = "http://radarr.invalid".to_string();
    config.catalog.api_key = "test-key".to_string();
    config.fetch.ytdlp_path = ytdlp.to_string_lossy().into_owned();
    config.fetch.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
    config.fetch.metadata_timeout_secs = 10;
    config.base_dir = library.parent().map(Path::to_path_buf).unwrap_or_default();
    config
}

/// Poll `condition` until it holds, panicking after ten seconds
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 10s");
}
