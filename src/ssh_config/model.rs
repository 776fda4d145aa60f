use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use super::error::Diagnostic;

/// Indentation used for new directive lines when a file has none to copy.
pub const DEFAULT_INDENT: &str = "    ";

/// A directive keyword. Known keywords get their own variant so matches stay
/// exhaustive; everything else round-trips through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Keyword {
    Host,
    Match,
    Include,
    HostName,
    User,
    Port,
    IdentityFile,
    CertificateFile,
    ProxyJump,
    ProxyCommand,
    LocalForward,
    RemoteForward,
    DynamicForward,
    ForwardX11,
    /// Any other directive, lower-cased.
    Other(String),
}

impl Keyword {
    /// Keywords are case-insensitive in ssh_config.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "host" => Keyword::Host,
            "match" => Keyword::Match,
            "include" => Keyword::Include,
            "hostname" => Keyword::HostName,
            "user" => Keyword::User,
            "port" => Keyword::Port,
            "identityfile" => Keyword::IdentityFile,
            "certificatefile" => Keyword::CertificateFile,
            "proxyjump" => Keyword::ProxyJump,
            "proxycommand" => Keyword::ProxyCommand,
            "localforward" => Keyword::LocalForward,
            "remoteforward" => Keyword::RemoteForward,
            "dynamicforward" => Keyword::DynamicForward,
            "forwardx11" => Keyword::ForwardX11,
            other => Keyword::Other(other.to_string()),
        }
    }

    /// The spelling used when the engine writes a new line for this keyword.
    pub fn canonical_name(&self) -> &str {
        match self {
            Keyword::Host => "Host",
            Keyword::Match => "Match",
            Keyword::Include => "Include",
            Keyword::HostName => "HostName",
            Keyword::User => "User",
            Keyword::Port => "Port",
            Keyword::IdentityFile => "IdentityFile",
            Keyword::CertificateFile => "CertificateFile",
            Keyword::ProxyJump => "ProxyJump",
            Keyword::ProxyCommand => "ProxyCommand",
            Keyword::LocalForward => "LocalForward",
            Keyword::RemoteForward => "RemoteForward",
            Keyword::DynamicForward => "DynamicForward",
            Keyword::ForwardX11 => "ForwardX11",
            Keyword::Other(name) => name,
        }
    }

    /// `Host` and `Match` open a new block.
    pub fn opens_block(&self) -> bool {
        matches!(self, Keyword::Host | Keyword::Match)
    }
}

/// One argument of a directive, with quotes stripped and escapes resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Whether the token was written with double quotes.
    pub quoted: bool,
    /// Byte range of the raw token (quotes included) in the file text.
    pub span: Range<usize>,
}

/// A `keyword value` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub keyword: Keyword,
    /// The keyword as written in the file.
    pub name: String,
    /// Raw value text, without the trailing comment.
    pub value: String,
    pub args: Vec<Token>,
    /// Trailing `# ...` comment, if any.
    pub comment: Option<String>,
    pub indent: String,
    /// Byte range of `value` in the file text.
    pub value_span: Range<usize>,
}

impl Directive {
    /// First argument with quotes stripped, or an empty string.
    pub fn first_arg(&self) -> &str {
        self.args.first().map(|t| t.text.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Blank,
    Comment,
    Directive(Directive),
    /// Something that isn't a directive (e.g. a line starting with `=`).
    /// Kept verbatim, never interpreted.
    Unparsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number in its file.
    pub number: usize,
    /// Byte range of the line content, without the line terminator.
    pub span: Range<usize>,
    /// Byte offset just past the line terminator (equal to `span.end` when
    /// the last line has none).
    pub end: usize,
    pub kind: LineKind,
}

impl Line {
    pub fn directive(&self) -> Option<&Directive> {
        match &self.kind {
            LineKind::Directive(d) => Some(d),
            _ => None,
        }
    }

    pub fn full_span(&self) -> Range<usize> {
        self.span.start..self.end
    }

    pub fn has_terminator(&self) -> bool {
        self.end > self.span.end
    }

    pub fn is_comment(&self) -> bool {
        self.kind == LineKind::Comment
    }

    pub fn is_blank(&self) -> bool {
        self.kind == LineKind::Blank
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockKind {
    /// Directives before the first `Host`/`Match` line of a file.
    Global,
    Host,
    Match,
}

/// Index of a loaded file within its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileId(pub usize);

/// A block, addressed by file and position within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId {
    pub file: FileId,
    pub index: usize,
}

/// A top-level block: the opening `Host`/`Match` line (if any) and every
/// line up to the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub file: FileId,
    /// Byte range in the file text, line terminators included.
    pub span: Range<usize>,
    pub lines: Vec<Line>,
}

impl Block {
    /// The `Host`/`Match` line itself. `None` for global blocks.
    pub fn header(&self) -> Option<&Directive> {
        match self.kind {
            BlockKind::Global => None,
            BlockKind::Host | BlockKind::Match => self.lines.first().and_then(Line::directive),
        }
    }

    /// Directives that belong to the block body (the header line excluded).
    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        let skip = usize::from(self.kind != BlockKind::Global);
        self.lines.iter().skip(skip).filter_map(Line::directive)
    }

    /// First directive with the given keyword; ssh_config is first-match-wins.
    pub fn find(&self, keyword: &Keyword) -> Option<&Directive> {
        self.directives().find(|d| &d.keyword == keyword)
    }

    /// Indentation of the first indented body directive.
    pub fn detect_indent(&self) -> Option<&str> {
        self.directives()
            .map(|d| d.indent.as_str())
            .find(|indent| !indent.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }

    pub(crate) fn detect(text: &str) -> Self {
        if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }
}

/// One file of the document. Owns the text that every span points into.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: FileId,
    pub path: PathBuf,
    pub text: String,
    pub blocks: Vec<Block>,
    pub line_ending: LineEnding,
    /// Indentation style for new directive lines.
    pub indent: String,
    /// Modification time seen when the file was read.
    pub modified: Option<SystemTime>,
}

impl SourceFile {
    pub fn slice(&self, range: Range<usize>) -> &str {
        &self.text[range]
    }

    /// All lines of the file in order, across blocks.
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.blocks.iter().flat_map(|b| b.lines.iter())
    }

    /// Rebuild the file text from its blocks.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| &self.text[b.span.clone()])
            .collect()
    }
}

/// An `Include` line and the files it pulled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeEdge {
    /// Block holding the `Include` line.
    pub from: BlockId,
    /// 1-based line number of the `Include` line.
    pub line: usize,
    pub patterns: Vec<String>,
    pub files: Vec<FileId>,
}

/// The parsed configuration: every file reached from the root, and the
/// merged order in which ssh would read their blocks.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    pub(crate) root: PathBuf,
    pub(crate) files: Vec<SourceFile>,
    pub(crate) order: Vec<BlockId>,
    pub(crate) includes: Vec<IncludeEdge>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl ConfigDocument {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loaded files in discovery order; the root file comes first.
    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    pub fn file(&self, id: FileId) -> &SourceFile {
        &self.files[id.0]
    }

    pub fn file_by_path(&self, path: &Path) -> Option<&SourceFile> {
        let wanted = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.files.iter().find(|f| {
            f.path == path || f.path.canonicalize().is_ok_and(|p| p == wanted)
        })
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.files[id.file.0].blocks[id.index]
    }

    /// Every block in the order ssh reads them, includes expanded in place.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.order.iter().map(|id| (*id, self.block(*id)))
    }

    pub fn includes(&self) -> &[IncludeEdge] {
        &self.includes
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether any loaded file was modified or removed since it was read.
    pub fn has_external_changes(&self) -> bool {
        self.files.iter().any(|f| {
            let current = std::fs::metadata(&f.path).and_then(|m| m.modified()).ok();
            current != f.modified
        })
    }
}

/// UI-facing view of a connectable `Host` block. Rebuilt from the document
/// whenever it changes; edits go through the writer, never through this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectableHostEntry {
    pub nickname: String,
    pub aliases: Vec<String>,
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub proxy_jump: Option<String>,
    pub proxy_command: Option<String>,
    pub identity_files: Vec<String>,
    pub certificate_file: Option<String>,
    pub local_forwards: Vec<String>,
    pub remote_forwards: Vec<String>,
    pub dynamic_forwards: Vec<String>,
    /// Every other directive as written, in file order.
    pub extra: Vec<(String, String)>,
    /// File that holds the block.
    pub source: PathBuf,
    /// The owning block, for writeback.
    #[serde(skip)]
    pub block: BlockId,
}

impl ConnectableHostEntry {
    /// Port to show in listings (ssh defaults to 22).
    pub fn display_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// Whether `name` is the nickname or one of the aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.nickname == name || self.aliases.iter().any(|a| a == name)
    }
}
