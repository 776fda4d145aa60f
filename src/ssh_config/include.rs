use std::path::{Path, PathBuf};

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    pattern.to_string()
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Resolve one `Include` pattern to the files it names, sorted by path.
/// Relative patterns are taken relative to `base_dir` (the directory of the
/// root config, like ssh does with `~/.ssh`).
///
/// `Err` carries a reason when a literal path is missing or the glob is
/// invalid. A glob matching nothing is not an error.
pub(crate) fn resolve_pattern(pattern: &str, base_dir: &Path) -> Result<Vec<PathBuf>, String> {
    let expanded = expand_tilde(pattern);
    let full = if Path::new(&expanded).is_absolute() {
        PathBuf::from(&expanded)
    } else {
        base_dir.join(&expanded)
    };

    if !has_glob_chars(&expanded) {
        if full.is_file() {
            return Ok(vec![full]);
        }
        return Err(format!("{} does not exist", full.display()));
    }

    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
    let mut matched: Vec<PathBuf> = paths
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file())
        .collect();
    matched.sort();
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.ssh/config.d/*");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, format!("{}/.ssh/config.d/*", home.display()));
        }
        assert_eq!(expand_tilde("/etc/ssh/ssh_config"), "/etc/ssh/ssh_config");
        assert_eq!(expand_tilde("config.d/*"), "config.d/*");
    }

    #[test]
    fn test_glob_matches_sorted_files_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let conf = dir.path().join("conf.d");
        fs::create_dir(&conf).unwrap();
        fs::write(conf.join("b.conf"), "").unwrap();
        fs::write(conf.join("a.conf"), "").unwrap();
        fs::write(conf.join("c.txt"), "").unwrap();
        fs::create_dir(conf.join("d.conf")).unwrap();

        let matched = resolve_pattern("conf.d/*.conf", dir.path()).unwrap();
        assert_eq!(matched, vec![conf.join("a.conf"), conf.join("b.conf")]);
    }

    #[test]
    fn test_glob_without_matches_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(resolve_pattern("nothing/*", dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_literal_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(resolve_pattern("missing.conf", dir.path()).is_err());
    }

    #[test]
    fn test_absolute_literal() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("extra");
        fs::write(&file, "Host x\n").unwrap();
        let other = tempfile::TempDir::new().unwrap();
        let matched = resolve_pattern(&file.to_string_lossy(), other.path()).unwrap();
        assert_eq!(matched, vec![file]);
    }
}
