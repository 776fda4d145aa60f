use std::path::PathBuf;

use serde::Serialize;

use super::alias::HostHeader;
use super::model::{Block, BlockId, BlockKind, ConfigDocument, ConnectableHostEntry, Keyword};

/// Why a block is a rule rather than a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleReason {
    Match,
    MissingHostName,
    Wildcard,
    Negated,
    EmptyPattern,
}

impl RuleReason {
    pub fn label(self) -> &'static str {
        match self {
            RuleReason::Match => "match block",
            RuleReason::MissingHostName => "no HostName",
            RuleReason::Wildcard => "wildcard pattern",
            RuleReason::Negated => "negated pattern",
            RuleReason::EmptyPattern => "empty Host line",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Connectable,
    Rule(RuleReason),
}

/// Classify a `Host` or `Match` block. Global blocks are never classified.
pub fn classify(block: &Block) -> Option<Classification> {
    match block.kind {
        BlockKind::Global => None,
        BlockKind::Match => Some(Classification::Rule(RuleReason::Match)),
        BlockKind::Host => {
            let header = block.host_header()?;
            Some(classify_host(block, header))
        }
    }
}

fn classify_host(block: &Block, header: HostHeader<'_>) -> Classification {
    let has_hostname = block
        .find(&Keyword::HostName)
        .is_some_and(|d| !d.args.is_empty());
    if !has_hostname {
        return Classification::Rule(RuleReason::MissingHostName);
    }
    if header.tokens().is_empty() {
        return Classification::Rule(RuleReason::EmptyPattern);
    }
    if header.patterns().any(|p| p.contains(['*', '?'])) {
        return Classification::Rule(RuleReason::Wildcard);
    }
    if header.patterns().any(|p| p.starts_with('!')) {
        return Classification::Rule(RuleReason::Negated);
    }
    Classification::Connectable
}

/// A `Host` or `Match` block that is kept as opaque text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleBlock {
    #[serde(skip)]
    pub block: BlockId,
    pub kind: BlockKind,
    pub reason: RuleReason,
    /// Tokens of the opening line (host patterns or match criteria).
    pub patterns: Vec<String>,
    pub source: PathBuf,
    /// Line number of the opening line.
    pub line: usize,
    /// The block exactly as written.
    pub text: String,
}

fn project(
    doc: &ConfigDocument,
    id: BlockId,
    block: &Block,
    header: HostHeader<'_>,
) -> ConnectableHostEntry {
    let first = |keyword: Keyword| block.find(&keyword).map(|d| d.first_arg().to_string());
    let all_raw = |keyword: Keyword| -> Vec<String> {
        block
            .directives()
            .filter(|d| d.keyword == keyword)
            .map(|d| d.value.clone())
            .collect()
    };

    let extra = block
        .directives()
        .filter(|d| matches!(d.keyword, Keyword::Other(_) | Keyword::ForwardX11))
        .map(|d| (d.name.clone(), d.value.clone()))
        .collect();

    ConnectableHostEntry {
        nickname: header.nickname().unwrap_or_default().to_string(),
        aliases: header.aliases().map(str::to_string).collect(),
        hostname: first(Keyword::HostName).unwrap_or_default(),
        user: first(Keyword::User),
        port: first(Keyword::Port).and_then(|p| p.parse().ok()),
        proxy_jump: first(Keyword::ProxyJump),
        proxy_command: block.find(&Keyword::ProxyCommand).map(|d| d.value.clone()),
        identity_files: block
            .directives()
            .filter(|d| d.keyword == Keyword::IdentityFile)
            .map(|d| d.first_arg().to_string())
            .collect(),
        certificate_file: first(Keyword::CertificateFile),
        local_forwards: all_raw(Keyword::LocalForward),
        remote_forwards: all_raw(Keyword::RemoteForward),
        dynamic_forwards: all_raw(Keyword::DynamicForward),
        extra,
        source: doc.file(id.file).path.clone(),
        block: id,
    }
}

impl ConfigDocument {
    /// Connectable hosts in the order ssh reads them.
    pub fn connectable_hosts(&self) -> Vec<ConnectableHostEntry> {
        self.blocks()
            .filter(|(_, block)| classify(block) == Some(Classification::Connectable))
            .filter_map(|(id, block)| {
                let header = block.host_header()?;
                Some(project(self, id, block, header))
            })
            .collect()
    }

    /// Every `Host`/`Match` block that is not a connectable host.
    pub fn rule_blocks(&self) -> Vec<RuleBlock> {
        self.blocks()
            .filter_map(|(id, block)| {
                let Some(Classification::Rule(reason)) = classify(block) else {
                    return None;
                };
                let header = block.header()?;
                let file = self.file(id.file);
                Some(RuleBlock {
                    block: id,
                    kind: block.kind,
                    reason,
                    patterns: header.args.iter().map(|t| t.text.clone()).collect(),
                    source: file.path.clone(),
                    line: block.lines.first().map(|l| l.number).unwrap_or(0),
                    text: file.slice(block.span.clone()).to_string(),
                })
            })
            .collect()
    }

    /// Look up a connectable host by nickname or alias. The first block
    /// that answers wins, like ssh.
    pub fn find_host(&self, name: &str) -> Option<ConnectableHostEntry> {
        let id = self.connectable_block(name)?;
        let block = self.block(id);
        Some(project(self, id, block, block.host_header()?))
    }

    pub(crate) fn connectable_block(&self, name: &str) -> Option<BlockId> {
        self.blocks()
            .find(|(_, block)| {
                classify(block) == Some(Classification::Connectable)
                    && block.host_header().is_some_and(|h| h.contains(name))
            })
            .map(|(id, _)| id)
    }

    /// Whether `name` appears as a token on any `Host` line. ssh compares
    /// host names without regard to case, so this does too.
    pub(crate) fn host_token_in_use(&self, name: &str) -> bool {
        self.blocks().any(|(_, block)| {
            block.host_header().is_some_and(|h| {
                h.patterns().any(|p| p.eq_ignore_ascii_case(name))
            })
        })
    }
}
