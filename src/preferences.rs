use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ssh_config::include::expand_tilde;
use crate::ssh_config::resolver::DEFAULT_RESOLVE_TIMEOUT;
use crate::ssh_config::writer::DEFAULT_BACKUP_COUNT;

/// Keys understood in the preferences file.
pub const KEYS: &[&str] = &[
    "ssh_program",
    "resolve_timeout_secs",
    "backup_count",
    "config_path",
];

/// Settings from `~/.sshdeck/preferences`. Missing or malformed values
/// fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    pub ssh_program: String,
    pub resolve_timeout: Duration,
    pub backup_count: usize,
    /// Root config file; `~/.ssh/config` when unset.
    pub config_path: Option<PathBuf>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            backup_count: DEFAULT_BACKUP_COUNT,
            config_path: None,
        }
    }
}

pub fn path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".sshdeck/preferences"))
}

/// Where edited config files are backed up. Kept away from the config
/// directories so an `Include` glob never picks a backup up.
pub fn backup_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".sshdeck/backups"))
}

/// The user's ssh config, `~/.ssh/config`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh/config"))
}

/// Check a key/value pair before it is saved.
pub fn validate(key: &str, value: &str) -> Result<(), String> {
    let value = value.trim();
    match key {
        "ssh_program" | "config_path" if value.is_empty() => Err(format!("{} can't be empty", key)),
        "ssh_program" | "config_path" => Ok(()),
        "resolve_timeout_secs" => match value.parse::<u64>() {
            Ok(0) => Err("timeout must be at least 1 second".to_string()),
            Ok(_) => Ok(()),
            Err(_) => Err(format!("'{}' is not a number of seconds", value)),
        },
        "backup_count" => value
            .parse::<usize>()
            .map(|_| ())
            .map_err(|_| format!("'{}' is not a count", value)),
        other => Err(format!(
            "unknown preference '{}' (known: {})",
            other,
            KEYS.join(", ")
        )),
    }
}

impl Preferences {
    /// Load from `~/.sshdeck/preferences`. Defaults if the file is missing.
    pub fn load() -> Self {
        match path() {
            Some(p) => Self::load_from(&p),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_str(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn parse_str(content: &str) -> Self {
        let mut prefs = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!("Ignoring preferences line without '=': {}", line);
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if let Err(reason) = validate(key, value) {
                tracing::warn!("Ignoring preference {}: {}", key, reason);
                continue;
            }
            match key {
                "ssh_program" => prefs.ssh_program = value.to_string(),
                "resolve_timeout_secs" => {
                    if let Ok(secs) = value.parse() {
                        prefs.resolve_timeout = Duration::from_secs(secs);
                    }
                }
                "backup_count" => {
                    if let Ok(count) = value.parse() {
                        prefs.backup_count = count;
                    }
                }
                "config_path" => prefs.config_path = Some(PathBuf::from(expand_tilde(value))),
                _ => {}
            }
        }
        prefs
    }

    /// The config file to open: the configured one or `~/.ssh/config`.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config_path.clone().or_else(default_config_path)
    }

    /// Every key with its effective value, in `KEYS` order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ssh_program", self.ssh_program.clone()),
            (
                "resolve_timeout_secs",
                self.resolve_timeout.as_secs().to_string(),
            ),
            ("backup_count", self.backup_count.to_string()),
            (
                "config_path",
                self.config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
        ]
    }
}

/// Save one key to ~/.sshdeck/preferences.
pub fn save_key(key: &str, value: &str) -> io::Result<()> {
    match path() {
        Some(p) => save_key_at(&p, key, value),
        None => Ok(()),
    }
}

/// Set `key` in the preferences file at `path`. Preserves unknown keys and
/// comments. Uses atomic write (tmp + rename) to prevent corruption.
pub fn save_key_at(path: &Path, key: &str, value: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let existing = fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = Vec::new();
    let mut found = false;

    for line in existing.lines() {
        let trimmed = line.trim();
        let is_key = !trimmed.starts_with('#')
            && trimmed
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
        if is_key && !found {
            lines.push(format!("{}={}", key, value.trim()));
            found = true;
        } else if !is_key {
            lines.push(line.to_string());
        }
    }

    if !found {
        lines.push(format!("{}={}", key, value.trim()));
    }

    let content = lines.join("\n") + "\n";

    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
    }

    #[cfg(not(unix))]
    fs::write(&tmp_path, &content)?;

    let result = fs::rename(&tmp_path, path);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
