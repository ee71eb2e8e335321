//! Process-liveness detection.

use super::{BrowserState, StateProbe};
use sysinfo::{ProcessRefreshKind, System};

/// RUNNING while a process with the configured image name exists.
pub struct ProcessProbe {
    image: String,
    system: System,
}

impl ProcessProbe {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: normalize_image(&image.into()),
            system: System::new(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        normalize_image(name) == self.image
    }
}

impl StateProbe for ProcessProbe {
    fn observe(&mut self) -> BrowserState {
        self.system.refresh_processes_specifics(ProcessRefreshKind::new());

        let running = self
            .system
            .processes()
            .values()
            .any(|process| self.matches(process.name()));

        if running {
            BrowserState::Running
        } else {
            BrowserState::Stopped
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Lowercase, without a trailing `.exe`.
fn normalize_image(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_normalization() {
        assert_eq!(normalize_image("Chrome.exe"), "chrome");
        assert_eq!(normalize_image(" firefox "), "firefox");
        let probe = ProcessProbe::new("opera.exe");
        assert!(probe.matches("Opera"));
        assert!(!probe.matches("operad"));
    }

    #[test]
    fn test_absent_process_is_stopped() {
        let mut probe = ProcessProbe::new("browsession-no-such-process-7f3a");
        assert_eq!(probe.observe(), BrowserState::Stopped);
    }
}
