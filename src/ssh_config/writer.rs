use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use super::alias::{quote_token, render_token, validate_name};
use super::error::WriteError;
use super::model::{BlockId, ConfigDocument, FileId, Keyword, Line, SourceFile};
use super::tokenizer::value_args;

/// Backups kept per file unless configured otherwise.
pub const DEFAULT_BACKUP_COUNT: usize = 5;

/// A host to append with [`Mutation::Add`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewHost {
    pub nickname: String,
    pub aliases: Vec<String>,
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub proxy_jump: Option<String>,
    pub proxy_command: Option<String>,
    /// Any other `(keyword, value)` directives, written in order.
    pub extra: Vec<(String, String)>,
}

/// An edit to a connectable host. Hosts are addressed by nickname or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Append a new host block to `file` (the root file when `None`).
    Add {
        host: NewHost,
        file: Option<PathBuf>,
    },
    /// Replace the first token of the `Host` line.
    Rename {
        nickname: String,
        new_nickname: String,
    },
    /// Replace every token after the nickname.
    SetAliases {
        nickname: String,
        aliases: Vec<String>,
    },
    /// Update the first directive with this keyword, or add one.
    SetDirective {
        nickname: String,
        keyword: String,
        value: String,
    },
    /// Remove every directive with this keyword from the block.
    UnsetDirective { nickname: String, keyword: String },
    Delete { nickname: String },
}

/// The new text of the one file a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub file: FileId,
    pub path: PathBuf,
    pub text: String,
    /// False when the new text is identical to what was loaded.
    pub changed: bool,
    pub(crate) loaded_modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    /// Timestamped backups to keep per file; 0 disables backups.
    pub backups: usize,
    /// Directory holding backups, mirroring each file's absolute path.
    /// `None` puts them next to the file, where an `Include dir/*` that
    /// covers the file would read them back as config.
    pub backup_dir: Option<PathBuf>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backups: DEFAULT_BACKUP_COUNT,
            backup_dir: None,
        }
    }
}

struct Splice {
    range: Range<usize>,
    text: String,
}

impl Splice {
    fn insert(at: usize, text: String) -> Self {
        Self {
            range: at..at,
            text,
        }
    }
}

fn apply_splices(text: &str, mut splices: Vec<Splice>) -> String {
    splices.sort_by_key(|s| s.range.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for splice in splices {
        out.push_str(&text[cursor..splice.range.start]);
        out.push_str(&splice.text);
        cursor = splice.range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn check_name(name: &str) -> Result<(), WriteError> {
    validate_name(name).map_err(|reason| WriteError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

fn check_value(keyword: &str, value: &str) -> Result<(), WriteError> {
    let reason = if value.trim().is_empty() {
        "value can't be empty"
    } else if value.contains(['\n', '\r']) {
        "value must fit on one line"
    } else {
        return Ok(());
    };
    Err(WriteError::InvalidValue {
        keyword: keyword.to_string(),
        reason: reason.to_string(),
    })
}

/// Parse a keyword given by the caller and reject the structural ones.
fn check_keyword(name: &str) -> Result<Keyword, WriteError> {
    if name.is_empty() || name.contains(|c: char| c.is_whitespace() || "=#\"".contains(c)) {
        return Err(WriteError::InvalidValue {
            keyword: name.to_string(),
            reason: "not a valid keyword".to_string(),
        });
    }
    let keyword = Keyword::parse(name);
    if keyword.opens_block() || keyword == Keyword::Include {
        return Err(WriteError::UnsupportedDirective(
            keyword.canonical_name().to_string(),
        ));
    }
    Ok(keyword)
}

/// Keywords that take exactly one argument. Their values are quoted when
/// needed so they read back as a single token.
fn takes_single_arg(keyword: &Keyword) -> bool {
    match keyword {
        Keyword::HostName
        | Keyword::User
        | Keyword::Port
        | Keyword::IdentityFile
        | Keyword::CertificateFile
        | Keyword::ProxyJump => true,
        Keyword::Other(name) => matches!(
            name.as_str(),
            "identityagent" | "controlpath" | "hostkeyalias" | "userknownhostsfile"
        ),
        _ => false,
    }
}

/// Text to write for `value`. Other values, commands included, go out as
/// given but must read back the same: no unquoted `#` starting an argument
/// and no unbalanced quote.
fn render_value(keyword: &Keyword, value: &str) -> Result<String, WriteError> {
    check_value(keyword.canonical_name(), value)?;
    if takes_single_arg(keyword) {
        return Ok(quote_token(value));
    }
    value_args(value).map_err(|reason| WriteError::InvalidValue {
        keyword: keyword.canonical_name().to_string(),
        reason,
    })?;
    Ok(value.to_string())
}

/// Spelling for a newly written keyword: canonical for known ones, as given
/// by the caller otherwise.
fn written_name(keyword: &Keyword, given: &str) -> String {
    match keyword {
        Keyword::Other(_) => given.to_string(),
        known => known.canonical_name().to_string(),
    }
}

impl ConfigDocument {
    /// Work out the new text for the file a mutation touches. Nothing is
    /// written; pass the result to [`commit`].
    pub fn plan_edit(&self, mutation: &Mutation) -> Result<PendingWrite, WriteError> {
        let (file, splices) = match mutation {
            Mutation::Add { host, file } => self.plan_add(host, file.as_deref())?,
            Mutation::Rename {
                nickname,
                new_nickname,
            } => self.plan_rename(nickname, new_nickname)?,
            Mutation::SetAliases { nickname, aliases } => self.plan_aliases(nickname, aliases)?,
            Mutation::SetDirective {
                nickname,
                keyword,
                value,
            } => self.plan_set(nickname, keyword, value)?,
            Mutation::UnsetDirective { nickname, keyword } => self.plan_unset(nickname, keyword)?,
            Mutation::Delete { nickname } => self.plan_delete(nickname)?,
        };

        let source = self.file(file);
        let text = apply_splices(&source.text, splices);
        Ok(PendingWrite {
            file,
            path: source.path.clone(),
            changed: text != source.text,
            text,
            loaded_modified: source.modified,
        })
    }

    fn target(&self, nickname: &str) -> Result<BlockId, WriteError> {
        self.connectable_block(nickname)
            .ok_or_else(|| WriteError::HostNotFound(nickname.to_string()))
    }

    fn plan_add(
        &self,
        host: &NewHost,
        path: Option<&Path>,
    ) -> Result<(FileId, Vec<Splice>), WriteError> {
        let mut names: Vec<&str> = Vec::with_capacity(host.aliases.len() + 1);
        for name in std::iter::once(&host.nickname).chain(&host.aliases) {
            check_name(name)?;
            if names.iter().any(|n| n.eq_ignore_ascii_case(name)) || self.host_token_in_use(name) {
                return Err(WriteError::DuplicateHost(name.clone()));
            }
            names.push(name);
        }
        check_value("HostName", &host.hostname)?;

        let mut directives: Vec<(String, String)> = Vec::new();
        let known = [
            (Keyword::HostName, Some(host.hostname.clone())),
            (Keyword::User, host.user.clone()),
            (Keyword::Port, host.port.map(|p| p.to_string())),
            (Keyword::IdentityFile, host.identity_file.clone()),
            (Keyword::ProxyJump, host.proxy_jump.clone()),
            (Keyword::ProxyCommand, host.proxy_command.clone()),
        ];
        for (keyword, value) in known {
            if let Some(value) = value {
                let value = render_value(&keyword, &value)?;
                directives.push((keyword.canonical_name().to_string(), value));
            }
        }
        for (key, value) in &host.extra {
            let keyword = check_keyword(key)?;
            let value = render_value(&keyword, value)?;
            directives.push((written_name(&keyword, key), value));
        }

        let file = match path {
            None => self.file(FileId(0)),
            Some(path) => self
                .file_by_path(path)
                .ok_or_else(|| WriteError::UnknownFile(path.to_path_buf()))?,
        };
        let eol = file.line_ending.as_str();

        let mut block = String::new();
        if !file.text.is_empty() {
            if !file.text.ends_with('\n') {
                block.push_str(eol);
            }
            if !file.lines().last().is_some_and(Line::is_blank) {
                block.push_str(eol);
            }
        }
        let header: Vec<String> = names.iter().map(|n| quote_token(n)).collect();
        block.push_str("Host ");
        block.push_str(&header.join(" "));
        block.push_str(eol);
        for (key, value) in directives {
            block.push_str(&file.indent);
            block.push_str(&key);
            block.push(' ');
            block.push_str(&value);
            block.push_str(eol);
        }

        Ok((file.id, vec![Splice::insert(file.text.len(), block)]))
    }

    fn plan_rename(
        &self,
        nickname: &str,
        new_nickname: &str,
    ) -> Result<(FileId, Vec<Splice>), WriteError> {
        check_name(new_nickname)?;
        let id = self.target(nickname)?;
        let block = self.block(id);
        let tokens = block.host_header().map(|h| h.tokens()).unwrap_or_default();
        let Some(first) = tokens.first() else {
            return Err(WriteError::HostNotFound(nickname.to_string()));
        };
        if first.text == new_nickname {
            return Ok((id.file, Vec::new()));
        }
        // A change of case only is not a clash with itself.
        if !first.text.eq_ignore_ascii_case(new_nickname) && self.host_token_in_use(new_nickname) {
            return Err(WriteError::DuplicateHost(new_nickname.to_string()));
        }
        Ok((
            id.file,
            vec![Splice {
                range: first.span.clone(),
                text: render_token(new_nickname, first.quoted),
            }],
        ))
    }

    fn plan_aliases(
        &self,
        nickname: &str,
        aliases: &[String],
    ) -> Result<(FileId, Vec<Splice>), WriteError> {
        let id = self.target(nickname)?;
        let block = self.block(id);
        let file = self.file(id.file);
        let tokens = block.host_header().map(|h| h.tokens()).unwrap_or_default();
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Err(WriteError::HostNotFound(nickname.to_string()));
        };

        let mut seen: Vec<&str> = vec![first.text.as_str()];
        let mut rendered = String::new();
        for alias in aliases {
            check_name(alias)?;
            let own = tokens[1..].iter().any(|t| t.text.eq_ignore_ascii_case(alias));
            let existing = tokens[1..].iter().find(|t| &t.text == alias);
            if seen.iter().any(|s| s.eq_ignore_ascii_case(alias))
                || (!own && self.host_token_in_use(alias))
            {
                return Err(WriteError::DuplicateHost(alias.clone()));
            }
            seen.push(alias);
            rendered.push(' ');
            match existing {
                Some(token) => rendered.push_str(file.slice(token.span.clone())),
                None => rendered.push_str(&quote_token(alias)),
            }
        }

        Ok((
            id.file,
            vec![Splice {
                range: first.span.end..last.span.end,
                text: rendered,
            }],
        ))
    }

    fn plan_set(
        &self,
        nickname: &str,
        key: &str,
        value: &str,
    ) -> Result<(FileId, Vec<Splice>), WriteError> {
        let keyword = check_keyword(key)?;
        let value = render_value(&keyword, value)?;
        let id = self.target(nickname)?;
        let block = self.block(id);
        let file = self.file(id.file);

        let body = &block.lines[1..];
        let existing = body
            .iter()
            .filter_map(Line::directive)
            .find(|d| d.keyword == keyword);
        if let Some(directive) = existing {
            let span = directive.value_span.clone();
            let mut text = value;
            if span.is_empty() {
                if !file.text[..span.start].ends_with([' ', '\t', '=']) {
                    text.insert(0, ' ');
                }
                // `User # note`: keep the comment a comment.
                if file.text[span.end..].starts_with('#') {
                    text.push(' ');
                }
            }
            return Ok((id.file, vec![Splice { range: span, text }]));
        }

        let anchor = body
            .iter()
            .rev()
            .find(|l| l.directive().is_some())
            .or_else(|| block.lines.first())
            .ok_or_else(|| WriteError::HostNotFound(nickname.to_string()))?;
        let eol = file.line_ending.as_str();
        let indent = block.detect_indent().unwrap_or(&file.indent);
        let line = format!("{}{} {}", indent, written_name(&keyword, key), value);
        let text = if anchor.has_terminator() {
            format!("{}{}", line, eol)
        } else {
            format!("{}{}", eol, line)
        };
        Ok((id.file, vec![Splice::insert(anchor.end, text)]))
    }

    fn plan_unset(&self, nickname: &str, key: &str) -> Result<(FileId, Vec<Splice>), WriteError> {
        let keyword = check_keyword(key)?;
        if keyword == Keyword::HostName {
            return Err(WriteError::RequiredDirective(
                keyword.canonical_name().to_string(),
            ));
        }
        let id = self.target(nickname)?;
        let splices = self.block(id).lines[1..]
            .iter()
            .filter(|l| l.directive().is_some_and(|d| d.keyword == keyword))
            .map(|l| Splice {
                range: l.full_span(),
                text: String::new(),
            })
            .collect();
        Ok((id.file, splices))
    }

    fn plan_delete(&self, nickname: &str) -> Result<(FileId, Vec<Splice>), WriteError> {
        let id = self.target(nickname)?;
        let file = self.file(id.file);
        let block = self.block(id);
        let start = attached_comment_start(file, id.index).unwrap_or(block.span.start);
        // Comments at the tail of this block describe the next host.
        let end = attached_comment_start(file, id.index + 1).unwrap_or(block.span.end);
        Ok((
            id.file,
            vec![Splice {
                range: start..end,
                text: String::new(),
            }],
        ))
    }
}

/// Start of the comment lines sitting directly on top of block `index`
/// (they belong to the previous block's span).
fn attached_comment_start(file: &SourceFile, index: usize) -> Option<usize> {
    file.blocks.get(index)?;
    let previous = file.blocks.get(index.checked_sub(1)?)?;
    let skip = usize::from(previous.header().is_some());
    previous.lines[skip..]
        .iter()
        .rev()
        .take_while(|l| l.is_comment())
        .last()
        .map(|l| l.span.start)
}

/// Write a planned edit to disk. Returns `false` when there was nothing to
/// write.
pub fn commit(pending: &PendingWrite, options: &WriteOptions) -> Result<bool, WriteError> {
    if !pending.changed {
        tracing::debug!("No changes for {}", pending.path.display());
        return Ok(false);
    }

    let current = fs::metadata(&pending.path).and_then(|m| m.modified()).ok();
    if current != pending.loaded_modified {
        tracing::warn!(
            "{} changed on disk since it was loaded",
            pending.path.display()
        );
        return Err(WriteError::ExternalModification(pending.path.clone()));
    }

    // Write through symlinks instead of replacing them.
    let target = pending
        .path
        .canonicalize()
        .unwrap_or_else(|_| pending.path.clone());

    let backup_dir = backup_location(&target, options).filter(|_| options.backups > 0);
    if let Some(dir) = backup_dir.filter(|_| target.exists()) {
        let backup = create_backup(&target, &dir)?;
        tracing::debug!("Backed up {} to {}", target.display(), backup.display());
        if let Err(e) = prune_backups(&target, &dir, options.backups) {
            tracing::warn!("Failed to prune backups of {}: {}", target.display(), e);
        }
    }

    write_atomic(&target, &pending.text)?;
    tracing::info!("Wrote {}", target.display());
    Ok(true)
}

fn write_atomic(target: &Path, content: &str) -> Result<(), WriteError> {
    let file_name = target
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    let tmp_path =
        target.with_file_name(format!(".{}.sshdeck_tmp.{}", file_name, std::process::id()));
    let permissions = fs::metadata(target).map(|m| m.permissions()).ok();

    let result = (|| -> io::Result<()> {
        let mut file = create_private(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        if let Some(permissions) = permissions {
            file.set_permissions(permissions)?;
        }
        file.sync_all()?;
        fs::rename(&tmp_path, target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(WriteError::from_io(target, e));
    }
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<fs::File> {
    fs::File::create(path)
}

fn backup_prefix(path: &Path) -> String {
    format!(
        "{}.bak.",
        path.file_name().unwrap_or_default().to_string_lossy()
    )
}

/// Directory for the backups of `target`: its own directory, or the mirror
/// of it under the configured backup directory.
fn backup_location(target: &Path, options: &WriteOptions) -> Option<PathBuf> {
    let parent = target.parent()?;
    Some(match &options.backup_dir {
        None => parent.to_path_buf(),
        Some(dir) => dir.join(
            parent
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect::<PathBuf>(),
        ),
    })
}

/// Copy `path` to `<name>.bak.<millis>` in `dir`.
fn create_backup(path: &Path, dir: &Path) -> Result<PathBuf, WriteError> {
    fs::create_dir_all(dir).map_err(|e| WriteError::from_io(dir, e))?;
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let backup_path = dir.join(format!("{}{}", backup_prefix(path), timestamp));
    fs::copy(path, &backup_path).map_err(|e| WriteError::from_io(&backup_path, e))?;
    Ok(backup_path)
}

/// Remove old backups of `path` from `dir`, keeping the newest `keep`.
fn prune_backups(path: &Path, dir: &Path, keep: usize) -> io::Result<()> {
    let prefix = backup_prefix(path);
    let mut backups: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .collect();
    backups.sort_by_key(|e| e.file_name());
    if backups.len() > keep {
        for old in &backups[..backups.len() - keep] {
            let _ = fs::remove_file(old.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse_str(content: &str) -> ConfigDocument {
        ConfigDocument::from_text(Path::new("/tmp/test_config"), content)
    }

    fn edit(content: &str, mutation: Mutation) -> String {
        parse_str(content).plan_edit(&mutation).unwrap().text
    }

    fn edit_err(content: &str, mutation: Mutation) -> WriteError {
        parse_str(content).plan_edit(&mutation).unwrap_err()
    }

    fn rename(nickname: &str, new_nickname: &str) -> Mutation {
        Mutation::Rename {
            nickname: nickname.to_string(),
            new_nickname: new_nickname.to_string(),
        }
    }

    fn set(nickname: &str, keyword: &str, value: &str) -> Mutation {
        Mutation::SetDirective {
            nickname: nickname.to_string(),
            keyword: keyword.to_string(),
            value: value.to_string(),
        }
    }

    fn unset(nickname: &str, keyword: &str) -> Mutation {
        Mutation::UnsetDirective {
            nickname: nickname.to_string(),
            keyword: keyword.to_string(),
        }
    }

    fn delete(nickname: &str) -> Mutation {
        Mutation::Delete {
            nickname: nickname.to_string(),
        }
    }

    fn add(host: NewHost) -> Mutation {
        Mutation::Add { host, file: None }
    }

    fn new_host(nickname: &str, hostname: &str) -> NewHost {
        NewHost {
            nickname: nickname.to_string(),
            hostname: hostname.to_string(),
            ..Default::default()
        }
    }

    const SCENARIO: &str = "\
Host bastion
 HostName 203.0.113.5
 User ops

Host internal-*
 ProxyJump bastion
";

    #[test]
    fn test_rename_changes_only_the_token() {
        let out = edit(SCENARIO, rename("bastion", "jump1"));
        assert_eq!(out, SCENARIO.replacen("Host bastion", "Host jump1", 1));
        assert!(out.contains("ProxyJump bastion"));
    }

    #[test]
    fn test_rename_by_alias_keeps_quotes() {
        let content = "Host \"my host\" mh # home box\n  HostName 10.0.0.1\n";
        let out = edit(content, rename("mh", "home"));
        assert_eq!(out, "Host \"home\" mh # home box\n  HostName 10.0.0.1\n");
        let out = edit(content, rename("my host", "my box"));
        assert_eq!(out, "Host \"my box\" mh # home box\n  HostName 10.0.0.1\n");
    }

    #[test]
    fn test_rename_to_same_name_is_noop() {
        let pending = parse_str(SCENARIO)
            .plan_edit(&rename("bastion", "bastion"))
            .unwrap();
        assert!(!pending.changed);
        assert_eq!(pending.text, SCENARIO);
    }

    #[test]
    fn test_rename_rejects_bad_names() {
        assert!(matches!(
            edit_err(SCENARIO, rename("bastion", "jump*")),
            WriteError::InvalidName { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, rename("bastion", "internal-*")),
            WriteError::InvalidName { .. }
        ));
        let content = "Host a\n  HostName x\nHost b\n  HostName y\n";
        assert!(matches!(
            edit_err(content, rename("a", "b")),
            WriteError::DuplicateHost(_)
        ));
    }

    #[test]
    fn test_rule_block_is_not_a_target() {
        assert!(matches!(
            edit_err(SCENARIO, rename("internal-*", "x")),
            WriteError::HostNotFound(_)
        ));
        assert!(matches!(
            edit_err(SCENARIO, delete("nowhere")),
            WriteError::HostNotFound(_)
        ));
    }

    #[test]
    fn test_set_aliases_reuses_raw_tokens() {
        let content = "Host web1 \"web one\"\tw1 # primary\n  HostName 10.0.0.1\n";
        let out = edit(
            content,
            Mutation::SetAliases {
                nickname: "web1".to_string(),
                aliases: vec!["web one".to_string(), "new alias".to_string()],
            },
        );
        assert_eq!(
            out,
            "Host web1 \"web one\" \"new alias\" # primary\n  HostName 10.0.0.1\n"
        );
    }

    #[test]
    fn test_set_aliases_clear_and_duplicates() {
        let content = "Host web1 w1 w2\n  HostName 10.0.0.1\nHost db\n  HostName 10.0.0.2\n";
        let cleared = edit(
            content,
            Mutation::SetAliases {
                nickname: "web1".to_string(),
                aliases: Vec::new(),
            },
        );
        assert!(cleared.starts_with("Host web1\n  HostName 10.0.0.1\n"));

        let err = edit_err(
            content,
            Mutation::SetAliases {
                nickname: "web1".to_string(),
                aliases: vec!["db".to_string()],
            },
        );
        assert!(matches!(err, WriteError::DuplicateHost(_)));
        let err = edit_err(
            content,
            Mutation::SetAliases {
                nickname: "web1".to_string(),
                aliases: vec!["x".to_string(), "x".to_string()],
            },
        );
        assert!(matches!(err, WriteError::DuplicateHost(_)));
    }

    #[test]
    fn test_set_existing_value_keeps_layout() {
        let content = "Host a\n\tport=22 # default\n  HostName x\n  Port 2200\n";
        let out = edit(content, set("a", "Port", "2222"));
        assert_eq!(out, "Host a\n\tport=2222 # default\n  HostName x\n  Port 2200\n");
    }

    #[test]
    fn test_set_new_directive_after_last_directive() {
        let content = "Host a\n    HostName x\n# trailing note\n\nHost b\n  HostName y\n";
        let out = edit(content, set("a", "user", "root"));
        assert_eq!(
            out,
            "Host a\n    HostName x\n    User root\n# trailing note\n\nHost b\n  HostName y\n"
        );
    }

    #[test]
    fn test_set_unknown_keyword_uses_given_spelling() {
        let out = edit("Host a\n  HostName x\n", set("a", "ServerAliveInterval", "30"));
        assert_eq!(out, "Host a\n  HostName x\n  ServerAliveInterval 30\n");
    }

    #[test]
    fn test_set_on_last_line_without_newline() {
        let out = edit("Host a\n  HostName x", set("a", "User", "me"));
        assert_eq!(out, "Host a\n  HostName x\n  User me");
    }

    #[test]
    fn test_set_keeps_crlf() {
        let out = edit("Host a\r\n  HostName x\r\n", set("a", "Port", "22"));
        assert_eq!(out, "Host a\r\n  HostName x\r\n  Port 22\r\n");
    }

    #[test]
    fn test_quoted_nickname_survives_unrelated_edit() {
        let content = "Host \"my host\"\n  HostName 10.0.0.1\n  User old\n";
        let out = edit(content, set("my host", "User", "new"));
        assert_eq!(out, "Host \"my host\"\n  HostName 10.0.0.1\n  User new\n");
    }

    #[test]
    fn test_set_fills_empty_value() {
        let content = "Host a\n  HostName x\n  User\n";
        let out = edit(content, set("a", "User", "me"));
        assert_eq!(out, "Host a\n  HostName x\n  User me\n");
    }

    #[test]
    fn test_set_empty_value_before_comment() {
        let content = "Host a\n  HostName x\n  User # fill me\n";
        let out = edit(content, set("a", "User", "me"));
        assert_eq!(out, "Host a\n  HostName x\n  User me # fill me\n");
        let entry = parse_str(&out).find_host("a").unwrap();
        assert_eq!(entry.user.as_deref(), Some("me"));
    }

    #[test]
    fn test_set_quotes_single_argument_values() {
        let content = "Host a\n  HostName x\n";
        let out = edit(content, set("a", "IdentityFile", "/keys/my key"));
        assert_eq!(out, "Host a\n  HostName x\n  IdentityFile \"/keys/my key\"\n");
        let entry = parse_str(&out).find_host("a").unwrap();
        assert_eq!(entry.identity_files, vec!["/keys/my key"]);

        let out = edit(content, set("a", "User", "#root"));
        assert_eq!(out, "Host a\n  HostName x\n  User \"#root\"\n");
        assert_eq!(
            parse_str(&out).find_host("a").unwrap().user.as_deref(),
            Some("#root")
        );

        let out = edit(
            "Host a\n  HostName x\n  IdentityFile ~/.ssh/old\n",
            set("a", "IdentityFile", "~/.ssh/id_ed25519"),
        );
        assert_eq!(out, "Host a\n  HostName x\n  IdentityFile ~/.ssh/id_ed25519\n");
    }

    #[test]
    fn test_set_command_value_written_as_given() {
        let out = edit(
            "Host a\n  HostName x\n",
            set("a", "ProxyCommand", "ssh -W %h:%p \"jump host\""),
        );
        assert_eq!(
            out,
            "Host a\n  HostName x\n  ProxyCommand ssh -W %h:%p \"jump host\"\n"
        );
    }

    #[test]
    fn test_set_rejects_values_that_read_back_differently() {
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "LocalCommand", "#echo hi")),
            WriteError::InvalidValue { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "ProxyCommand", "nc %h %p #note")),
            WriteError::InvalidValue { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "SendEnv", "\"LANG")),
            WriteError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_set_rejects_structural_and_multiline() {
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "Include", "other")),
            WriteError::UnsupportedDirective(_)
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "host", "x")),
            WriteError::UnsupportedDirective(_)
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "User", "a\nHost evil")),
            WriteError::InvalidValue { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "User", "  ")),
            WriteError::InvalidValue { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, set("bastion", "Bad Key", "x")),
            WriteError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_unset_removes_every_occurrence() {
        let content = "Host a\n  HostName x\n  IdentityFile one\n  User me\n  identityfile two\n";
        let out = edit(content, unset("a", "IdentityFile"));
        assert_eq!(out, "Host a\n  HostName x\n  User me\n");
    }

    #[test]
    fn test_unset_hostname_refused() {
        assert!(matches!(
            edit_err(SCENARIO, unset("bastion", "hostname")),
            WriteError::RequiredDirective(_)
        ));
    }

    #[test]
    fn test_unset_missing_is_noop() {
        let pending = parse_str(SCENARIO)
            .plan_edit(&unset("bastion", "Port"))
            .unwrap();
        assert!(!pending.changed);
    }

    #[test]
    fn test_delete_takes_attached_comments() {
        let content = "\
Host a
  HostName x

# about b
# more about b
Host b
  HostName y

Host c
  HostName z
";
        let out = edit(content, delete("b"));
        assert_eq!(out, "Host a\n  HostName x\n\nHost c\n  HostName z\n");
    }

    #[test]
    fn test_delete_leaves_next_hosts_comments() {
        let content = "Host a\n  HostName x\n\n# about b\nHost b\n  HostName y\n";
        let out = edit(content, delete("a"));
        assert_eq!(out, "# about b\nHost b\n  HostName y\n");

        let content = "\
Host a
  HostName x

# about b
Host b
  HostName y

# about c
Host c
  HostName z
";
        let out = edit(content, delete("b"));
        assert_eq!(
            out,
            "Host a\n  HostName x\n\n# about c\nHost c\n  HostName z\n"
        );
    }

    #[test]
    fn test_delete_leaves_detached_comment() {
        let content = "# file header\n\nHost b\n  HostName y\n";
        let out = edit(content, delete("b"));
        assert_eq!(out, "# file header\n\n");
    }

    #[test]
    fn test_delete_is_isolated() {
        let content = "Host a\n  HostName x\n\nHost b\n  HostName y\n\nHost c\n  HostName z\n";
        let out = edit(content, delete("b"));
        assert_eq!(out, "Host a\n  HostName x\n\nHost c\n  HostName z\n");
    }

    #[test]
    fn test_edit_leaves_other_blocks_untouched() {
        let content = "\
Host *
  ServerAliveInterval 60

Host a
  HostName x

Match host c
  User z
";
        let out = edit(content, set("a", "Port", "2222"));
        let before = "Host *\n  ServerAliveInterval 60\n\n";
        let after = "Match host c\n  User z\n";
        assert!(out.starts_with(before));
        assert!(out.ends_with(after));
        assert_eq!(
            &out[before.len()..out.len() - after.len()],
            "Host a\n  HostName x\n  Port 2222\n\n"
        );
    }

    #[test]
    fn test_add_to_empty_file() {
        let host = NewHost {
            user: Some("admin".to_string()),
            port: Some(2222),
            aliases: vec!["nick name".to_string()],
            ..new_host("web1", "10.0.0.1")
        };
        let out = edit("", add(host));
        assert_eq!(
            out,
            "Host web1 \"nick name\"\n    HostName 10.0.0.1\n    User admin\n    Port 2222\n"
        );
    }

    #[test]
    fn test_add_appends_with_separator() {
        let out = edit("Host a\n\tHostName x\n", add(new_host("b", "y")));
        assert_eq!(out, "Host a\n\tHostName x\n\nHost b\n\tHostName y\n");
        let out = edit("Host a\n  HostName x", add(new_host("b", "y")));
        assert_eq!(out, "Host a\n  HostName x\n\nHost b\n  HostName y\n");
        let out = edit("Host a\n  HostName x\n\n", add(new_host("b", "y")));
        assert_eq!(out, "Host a\n  HostName x\n\nHost b\n  HostName y\n");
    }

    #[test]
    fn test_add_extra_directives() {
        let host = NewHost {
            proxy_jump: Some("bastion".to_string()),
            extra: vec![("forwardagent".to_string(), "yes".to_string())],
            ..new_host("b", "y")
        };
        let out = edit("", add(host));
        assert_eq!(
            out,
            "Host b\n    HostName y\n    ProxyJump bastion\n    forwardagent yes\n"
        );

        let host = NewHost {
            extra: vec![("Match".to_string(), "all".to_string())],
            ..new_host("b", "y")
        };
        assert!(matches!(
            edit_err("", add(host)),
            WriteError::UnsupportedDirective(_)
        ));
    }

    #[test]
    fn test_add_quotes_values() {
        let host = NewHost {
            identity_file: Some("/keys/my key".to_string()),
            proxy_command: Some("nc %h %p".to_string()),
            ..new_host("b", "y")
        };
        let out = edit("", add(host));
        assert_eq!(
            out,
            "Host b\n    HostName y\n    IdentityFile \"/keys/my key\"\n    ProxyCommand nc %h %p\n"
        );

        let host = NewHost {
            extra: vec![("LocalCommand".to_string(), "echo \"hi".to_string())],
            ..new_host("b", "y")
        };
        assert!(matches!(
            edit_err("", add(host)),
            WriteError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_names_clash_regardless_of_case() {
        let content = "Host web1 w1\n  HostName x\nHost db\n  HostName y\n";
        assert!(matches!(
            edit_err(content, add(new_host("WEB1", "z"))),
            WriteError::DuplicateHost(_)
        ));
        let host = NewHost {
            aliases: vec!["Web2".to_string(), "web2".to_string()],
            ..new_host("web3", "z")
        };
        assert!(matches!(
            edit_err(content, add(host)),
            WriteError::DuplicateHost(_)
        ));
        assert!(matches!(
            edit_err(content, rename("db", "Web1")),
            WriteError::DuplicateHost(_)
        ));
        assert!(matches!(
            edit_err(
                content,
                Mutation::SetAliases {
                    nickname: "db".to_string(),
                    aliases: vec!["W1".to_string()],
                },
            ),
            WriteError::DuplicateHost(_)
        ));

        // A host may change the case of its own names.
        let out = edit(content, rename("web1", "Web1"));
        assert!(out.starts_with("Host Web1 w1\n"));
        let out = edit(
            content,
            Mutation::SetAliases {
                nickname: "web1".to_string(),
                aliases: vec!["W1".to_string()],
            },
        );
        assert!(out.starts_with("Host web1 W1\n"));
    }

    #[test]
    fn test_add_validation() {
        assert!(matches!(
            edit_err(SCENARIO, add(new_host("bastion", "1.2.3.4"))),
            WriteError::DuplicateHost(_)
        ));
        assert!(matches!(
            edit_err(SCENARIO, add(new_host("web*", "1.2.3.4"))),
            WriteError::InvalidName { .. }
        ));
        assert!(matches!(
            edit_err(SCENARIO, add(new_host("web", ""))),
            WriteError::InvalidValue { .. }
        ));
        let err = parse_str(SCENARIO)
            .plan_edit(&Mutation::Add {
                host: new_host("web", "1.2.3.4"),
                file: Some(PathBuf::from("/tmp/not-loaded")),
            })
            .unwrap_err();
        assert!(matches!(err, WriteError::UnknownFile(_)));
    }

    #[test]
    fn test_commit_writes_and_backs_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, SCENARIO).unwrap();
        let doc = ConfigDocument::load(&path).unwrap();

        let pending = doc.plan_edit(&rename("bastion", "jump1")).unwrap();
        assert!(commit(&pending, &WriteOptions::default()).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), pending.text);

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("config.bak."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), SCENARIO);
    }

    #[test]
    fn test_commit_noop_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, SCENARIO).unwrap();
        let doc = ConfigDocument::load(&path).unwrap();

        let pending = doc.plan_edit(&unset("bastion", "Port")).unwrap();
        assert!(!commit(&pending, &WriteOptions::default()).unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_refuses_external_modification() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, SCENARIO).unwrap();
        let doc = ConfigDocument::load(&path).unwrap();

        fs::write(&path, "Host other\n  HostName z\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        let pending = doc.plan_edit(&rename("bastion", "jump1")).unwrap();
        let err = commit(&pending, &WriteOptions::default()).unwrap_err();
        assert!(matches!(err, WriteError::ExternalModification(_)));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Host other\n  HostName z\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_backs_up_into_backup_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let backups = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, SCENARIO).unwrap();
        let doc = ConfigDocument::load(&path).unwrap();

        let pending = doc.plan_edit(&rename("bastion", "jump1")).unwrap();
        let options = WriteOptions {
            backups: 5,
            backup_dir: Some(backups.path().to_path_buf()),
        };
        assert!(commit(&pending, &options).unwrap());

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        let parent = dir.path().canonicalize().unwrap();
        let mirror = backups.path().join(parent.strip_prefix("/").unwrap());
        let saved: Vec<_> = fs::read_dir(&mirror)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].file_name().to_string_lossy().starts_with("config.bak."));
        assert_eq!(fs::read_to_string(saved[0].path()).unwrap(), SCENARIO);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "").unwrap();
        for stamp in ["1000", "1001", "1002", "1003"] {
            fs::write(dir.path().join(format!("config.bak.{}", stamp)), "").unwrap();
        }
        prune_backups(&path, dir.path(), 2).unwrap();
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["config", "config.bak.1002", "config.bak.1003"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, SCENARIO).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let doc = ConfigDocument::load(&path).unwrap();
        let pending = doc.plan_edit(&rename("bastion", "jump1")).unwrap();
        commit(
            &pending,
            &WriteOptions {
                backups: 0,
                backup_dir: None,
            },
        )
        .unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let fresh = dir.path().join("fresh");
        let doc = ConfigDocument::from_text(&fresh, "");
        let pending = doc.plan_edit(&add(new_host("web", "10.0.0.1"))).unwrap();
        commit(&pending, &WriteOptions::default()).unwrap();
        let mode = fs::metadata(&fresh).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_commit_follows_symlink() {
        let dir = tempfile::TempDir::new().unwrap();
        let real = dir.path().join("real_config");
        fs::write(&real, SCENARIO).unwrap();
        let link = dir.path().join("config");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let doc = ConfigDocument::load(&link).unwrap();
        let pending = doc.plan_edit(&rename("bastion", "jump1")).unwrap();
        commit(
            &pending,
            &WriteOptions {
                backups: 0,
                backup_dir: None,
            },
        )
        .unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(fs::read_to_string(&real).unwrap().starts_with("Host jump1\n"));
    }
}
