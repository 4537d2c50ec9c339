use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult, anyhow};
use serde::{Deserialize, Serialize};

use crate::theme::ThemeMode;

/// Durable light/dark preference. Read once at startup, written on every toggle.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    dark_mode: bool,
}

impl Preferences {
    pub fn load_or_default(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let dark_mode = match fs::read_to_string(path) {
            Ok(contents) => {
                serde_json::from_str::<StoredPreferences>(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?
                    .dark_mode
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                return Err(anyhow!("failed to read {}: {}", path.display(), err));
            }
        };
        Ok(Preferences {
            path: path.to_path_buf(),
            dark_mode,
        })
    }

    /// Light-mode defaults bound to `path`; the next toggle overwrites the file.
    pub fn reset_at(path: impl AsRef<Path>) -> Self {
        Preferences {
            path: path.as_ref().to_path_buf(),
            dark_mode: false,
        }
    }

    pub fn theme_mode(&self) -> ThemeMode {
        ThemeMode::from_dark_flag(self.dark_mode)
    }

    pub fn dark_mode(&self) -> bool {
        self.dark_mode
    }

    /// Flips the flag and persists it. The in-memory flag changes even when the
    /// write fails so the session keeps the user's choice.
    pub fn toggle_dark_mode(&mut self) -> AnyResult<ThemeMode> {
        self.dark_mode = !self.dark_mode;
        self.save()?;
        Ok(self.theme_mode())
    }

    fn save(&self) -> AnyResult<()> {
        let stored = StoredPreferences {
            dark_mode: self.dark_mode,
        };
        let payload = serde_json::to_string_pretty(&stored)?;
        fs::write(&self.path, payload)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[derive(Serialize, Deserialize)]
struct StoredPreferences {
    #[serde(default)]
    dark_mode: bool,
}
