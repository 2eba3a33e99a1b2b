use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown,
}

pub fn detect() -> Platform {
    match std::env::consts::OS {
        "macos" => Platform::MacOS,
        "linux" => Platform::Linux,
        "windows" => Platform::Windows,
        _ => Platform::Unknown,
    }
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Where the host keeps its live session state.
/// macOS: ~/Library/Application Support/<name>/User/globalStorage
/// Linux: ~/.config/<name>/User/globalStorage
/// Windows: %APPDATA%\<name>\User\globalStorage
pub fn default_state_dir(host_name: &str) -> Option<PathBuf> {
    let base = directories::BaseDirs::new()?;
    Some(
        base.config_dir()
            .join(host_name)
            .join("User")
            .join("globalStorage"),
    )
}

/// Conventional install locations, most likely first. The bare name is
/// resolved through PATH when none of these exist.
pub fn default_executable_candidates(host_name: &str, platform: Platform) -> Vec<PathBuf> {
    let lower = host_name.to_lowercase();
    match platform {
        Platform::MacOS => vec![
            PathBuf::from(format!("/Applications/{host_name}.app/Contents/MacOS/Electron")),
            PathBuf::from(format!("/Applications/{host_name}.app/Contents/MacOS/{host_name}")),
        ],
        Platform::Windows => {
            let mut candidates = Vec::new();
            if let Some(local) = std::env::var_os("LOCALAPPDATA") {
                candidates.push(
                    PathBuf::from(local)
                        .join("Programs")
                        .join(host_name)
                        .join(format!("{host_name}.exe")),
                );
            }
            if let Some(program_files) = std::env::var_os("ProgramFiles") {
                candidates.push(
                    PathBuf::from(program_files)
                        .join(host_name)
                        .join(format!("{host_name}.exe")),
                );
            }
            candidates
        }
        Platform::Linux | Platform::Unknown => {
            let mut candidates = vec![
                PathBuf::from(format!("/usr/share/{lower}/{lower}")),
                PathBuf::from(format!("/opt/{host_name}/{lower}")),
            ];
            if let Some(home) = home_dir() {
                candidates.push(home.join(".local/share").join(&lower).join(&lower));
            }
            candidates
        }
    }
}

/// Search PATH for an executable with the given name.
pub fn which(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| {
            let plain = dir.join(name);
            let exe = dir.join(format!("{name}.exe"));
            [plain, exe]
        })
        .find(|candidate| candidate.is_file())
}

/// Builds the command that hands a URI to the desktop's default handler.
pub fn uri_opener(uri: &str, platform: Platform) -> Command {
    match platform {
        Platform::MacOS => {
            let mut cmd = Command::new("open");
            cmd.arg(uri);
            cmd
        }
        Platform::Windows => {
            // the empty string is the window title argument `start` expects
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", ""]).arg(uri);
            cmd
        }
        Platform::Linux | Platform::Unknown => {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(uri);
            cmd
        }
    }
}

/// Directory our own binary runs from. Processes started from here are ours,
/// never the host's.
pub fn own_install_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}
