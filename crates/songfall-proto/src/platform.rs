use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DAEMON_TCP_PORT: u16 = 9877;

/// Global flag to control whether to use system-installed binaries from PATH
/// instead of ones shipped beside the executable.
static USE_SYSTEM_DEPS: AtomicBool = AtomicBool::new(false);

/// Set whether to use system dependencies (from PATH) instead of bundled ones.
pub fn set_use_system_deps(use_system: bool) {
    USE_SYSTEM_DEPS.store(use_system, Ordering::Relaxed);
}

/// Check whether to use system dependencies from PATH.
pub fn should_use_system_deps() -> bool {
    USE_SYSTEM_DEPS.load(Ordering::Relaxed)
}

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    format!("{}/songfall-mpv.sock", std::env::temp_dir().display())
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "songfall-mpv".to_string()
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

pub fn data_dir() -> PathBuf {
    // XDG layout on macOS too, for consistency with Linux
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("songfall")
    }
    #[cfg(windows)]
    {
        if let Some(dir) = portable_dir("data") {
            return dir;
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("songfall")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                if exe_dir.join("config.toml").exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("songfall")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("songfall")
    }
}

#[cfg(windows)]
fn portable_dir(name: &str) -> Option<PathBuf> {
    let exe_path = std::env::current_exe().ok()?;
    let dir = exe_path.parent()?.join(name);
    dir.exists().then_some(dir)
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    path.split(sep)
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|p| p.exists())
}

/// Find mpv binary for playback.
/// If use_system_deps is true, skips the binary beside the exe and uses PATH only.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = mpv_binary_name();

    if !should_use_system_deps() {
        if let Ok(current_exe) = std::env::current_exe() {
            if let Some(dir) = current_exe.parent() {
                let local_mpv = dir.join(exe_name);
                if local_mpv.exists() {
                    return Some(local_mpv);
                }
            }
        }
    }

    find_on_path(exe_name)
}
