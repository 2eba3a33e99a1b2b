//! Decides which processes belong to the host application.

use std::path::{Path, PathBuf};

use crate::platform::Platform;

#[derive(Debug, Clone)]
pub struct HostMatcher {
    platform: Platform,
    name: String,
    lower: String,
    own_pid: Option<u32>,
    own_dir: Option<String>,
}

impl HostMatcher {
    pub fn new(name: &str, platform: Platform) -> Self {
        HostMatcher {
            platform,
            name: name.to_string(),
            lower: name.to_lowercase(),
            own_pid: None,
            own_dir: None,
        }
    }

    /// Never match our own process or anything running from our install dir.
    pub fn excluding_self(mut self, pid: u32, install_dir: Option<PathBuf>) -> Self {
        self.own_pid = Some(pid);
        self.own_dir = install_dir.map(|d| d.to_string_lossy().to_lowercase());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, pid: u32, process_name: &str, exe: Option<&Path>) -> bool {
        if self.own_pid == Some(pid) {
            return false;
        }

        let process_name = process_name.to_lowercase();
        let exe = exe
            .map(|p| p.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if let Some(own_dir) = &self.own_dir {
            // whole components only: /opt/anti must not cover /opt/antigravity
            if !exe.is_empty() && Path::new(&exe).starts_with(Path::new(own_dir)) {
                return false;
            }
        }

        match self.platform {
            Platform::MacOS => exe.contains(&format!("{}.app", self.lower)),
            Platform::Windows => {
                let exact = process_name == format!("{}.exe", self.lower) || process_name == self.lower;
                // a switcher or manager installed beside the host is not the host
                let in_path = exe.contains(&self.lower) && !process_name.contains("manager");
                exact || in_path
            }
            Platform::Linux | Platform::Unknown => {
                process_name == self.lower
                    || exe.contains(&format!("/{}/", self.lower))
                    || exe.ends_with(&format!("/{}", self.lower))
            }
        }
    }
}
