use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::preferences::{self, Preferences};
use crate::ssh_config::classify::RuleBlock;
use crate::ssh_config::error::{Diagnostic, LoadError, ResolutionError, WriteError};
use crate::ssh_config::model::{ConfigDocument, ConnectableHostEntry, SourceFile};
use crate::ssh_config::resolver::{
    self, CancelToken, ConfigDump, DEFAULT_RESOLVE_TIMEOUT, EffectiveConfig, SshClient,
};
use crate::ssh_config::writer::{self, DEFAULT_BACKUP_COUNT, Mutation, WriteOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub ssh_program: PathBuf,
    pub resolve_timeout: Duration,
    pub backup_count: usize,
    /// `None` keeps backups next to each file.
    pub backup_dir: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            backup_count: DEFAULT_BACKUP_COUNT,
            backup_dir: preferences::backup_dir(),
        }
    }
}

impl From<&Preferences> for EngineOptions {
    fn from(prefs: &Preferences) -> Self {
        Self {
            ssh_program: PathBuf::from(&prefs.ssh_program),
            resolve_timeout: prefs.resolve_timeout,
            backup_count: prefs.backup_count,
            backup_dir: preferences::backup_dir(),
        }
    }
}

/// `-F` is only needed when the root isn't the user's own config; passing it
/// for `~/.ssh/config` would drop the system-wide config.
fn explicit_config_file(root: &Path) -> Option<PathBuf> {
    let default = preferences::default_config_path()?;
    let same = root == default
        || matches!(
            (root.canonicalize(), default.canonicalize()),
            (Ok(a), Ok(b)) if a == b
        );
    if same { None } else { Some(root.to_path_buf()) }
}

/// Owns the loaded config and everything needed to read, resolve and edit
/// it. Reads take `&self`; edits and reloads take `&mut self`.
pub struct ConfigEngine<D: ConfigDump = SshClient> {
    document: ConfigDocument,
    resolver: D,
    write: WriteOptions,
}

impl ConfigEngine<SshClient> {
    /// Load `root` and resolve through the system SSH client.
    pub fn open(root: &Path, options: &EngineOptions) -> Result<Self, LoadError> {
        let resolver = SshClient::new(&options.ssh_program)
            .with_timeout(options.resolve_timeout)
            .with_config_file(explicit_config_file(root));
        Self::with_resolver(
            root,
            resolver,
            WriteOptions {
                backups: options.backup_count,
                backup_dir: options.backup_dir.clone(),
            },
        )
    }
}

impl<D: ConfigDump> ConfigEngine<D> {
    pub fn with_resolver(root: &Path, resolver: D, write: WriteOptions) -> Result<Self, LoadError> {
        let document = ConfigDocument::load(root)?;
        Ok(Self {
            document,
            resolver,
            write,
        })
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn resolver(&self) -> &D {
        &self.resolver
    }

    pub fn root(&self) -> &Path {
        self.document.root()
    }

    pub fn list_connectable_hosts(&self) -> Vec<ConnectableHostEntry> {
        self.document.connectable_hosts()
    }

    pub fn rule_blocks(&self) -> Vec<RuleBlock> {
        self.document.rule_blocks()
    }

    pub fn find_host(&self, name: &str) -> Option<ConnectableHostEntry> {
        self.document.find_host(name)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.document.diagnostics()
    }

    pub fn files(&self) -> &[SourceFile] {
        self.document.files()
    }

    /// Ask the SSH client for the effective settings of `nickname`. Never
    /// touches the loaded document.
    pub fn resolve_effective_config(
        &self,
        nickname: &str,
    ) -> Result<EffectiveConfig, ResolutionError> {
        self.resolve_effective_config_with(nickname, &CancelToken::new())
    }

    pub fn resolve_effective_config_with(
        &self,
        nickname: &str,
        cancel: &CancelToken,
    ) -> Result<EffectiveConfig, ResolutionError> {
        resolver::resolve(&self.resolver, nickname, cancel)
    }

    /// Apply one mutation to disk and reload. Returns `false` when the edit
    /// changed nothing and no file was written.
    pub fn apply_edit(&mut self, mutation: &Mutation) -> Result<bool, WriteError> {
        tracing::debug!("Applying {:?}", mutation);
        let pending = self.document.plan_edit(mutation)?;
        let written = writer::commit(&pending, &self.write)?;
        if written {
            self.reload().map_err(WriteError::Reload)?;
        }
        Ok(written)
    }

    /// Re-read every file from disk.
    pub fn reload(&mut self) -> Result<(), LoadError> {
        self.document = ConfigDocument::load(self.document.root())?;
        Ok(())
    }

    pub fn has_external_changes(&self) -> bool {
        self.document.has_external_changes()
    }
}
