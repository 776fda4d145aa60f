use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::error::{Diagnostic, DiagnosticKind, LoadError};
use super::include;
use super::model::{
    Block, BlockId, BlockKind, ConfigDocument, DEFAULT_INDENT, FileId, IncludeEdge, Keyword,
    Line, LineEnding, SourceFile,
};
use super::tokenizer::tokenize;

/// ssh itself gives up after 16 levels of Include.
const MAX_INCLUDE_DEPTH: usize = 16;

impl ConfigDocument {
    /// Load the config at `root` and everything it includes.
    /// Only a missing or unreadable root file is an error.
    pub fn load(root: &Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(root).map_err(|e| LoadError::from_io(root, e))?;
        let modified = modified_time(root);
        tracing::debug!("Loading SSH config from {}", root.display());
        Ok(Self::build(root, text, modified))
    }

    /// Parse config text as if it had been read from `path`. Includes are
    /// still resolved relative to the directory of `path`.
    pub fn from_text(path: &Path, text: &str) -> Self {
        Self::build(path, text.to_string(), None)
    }

    fn build(root: &Path, text: String, modified: Option<SystemTime>) -> Self {
        let base_dir = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut loader = Loader {
            base_dir,
            files: Vec::new(),
            order: Vec::new(),
            includes: Vec::new(),
            diagnostics: Vec::new(),
            stack: Vec::new(),
            seen: HashSet::new(),
            cycle_edges: HashSet::new(),
        };
        loader.add_file(root, text, modified);

        let document = ConfigDocument {
            root: root.to_path_buf(),
            files: loader.files,
            order: loader.order,
            includes: loader.includes,
            diagnostics: loader.diagnostics,
        };
        tracing::info!(
            "Loaded {} file(s), {} block(s) from {}",
            document.files.len(),
            document.order.len(),
            root.display()
        );
        document
    }
}

/// Group a file's lines into blocks. Every `Host`/`Match` line starts a
/// block; lines before the first one form a global block.
pub(crate) fn assemble(file: FileId, lines: Vec<Line>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;

    for line in lines {
        let opens = match line.directive().map(|d| &d.keyword) {
            Some(Keyword::Host) => Some(BlockKind::Host),
            Some(Keyword::Match) => Some(BlockKind::Match),
            _ => None,
        };

        match (opens, current.as_mut()) {
            (Some(kind), _) => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
                current = Some(Block {
                    kind,
                    file,
                    span: line.full_span(),
                    lines: vec![line],
                });
            }
            (None, Some(block)) => {
                block.span.end = line.end;
                block.lines.push(line);
            }
            (None, None) => {
                current = Some(Block {
                    kind: BlockKind::Global,
                    file,
                    span: line.full_span(),
                    lines: vec![line],
                });
            }
        }
    }

    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn detect_indent(blocks: &[Block]) -> String {
    blocks
        .iter()
        .filter(|b| b.kind != BlockKind::Global)
        .find_map(Block::detect_indent)
        .unwrap_or(DEFAULT_INDENT)
        .to_string()
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

struct PendingInclude {
    block: usize,
    line: usize,
    patterns: Vec<String>,
}

struct Loader {
    base_dir: PathBuf,
    files: Vec<SourceFile>,
    order: Vec<BlockId>,
    includes: Vec<IncludeEdge>,
    diagnostics: Vec<Diagnostic>,
    /// Files currently being expanded, outermost first.
    stack: Vec<PathBuf>,
    /// Every file loaded so far.
    seen: HashSet<PathBuf>,
    /// (including file, line, included file) already reported as a cycle.
    cycle_edges: HashSet<(PathBuf, usize, PathBuf)>,
}

impl Loader {
    fn add_file(&mut self, path: &Path, text: String, modified: Option<SystemTime>) -> FileId {
        let key = canonical(path);
        self.seen.insert(key.clone());
        self.stack.push(key);

        let id = FileId(self.files.len());
        let lines = tokenize(&text, path, &mut self.diagnostics);
        let blocks = assemble(id, lines);

        let mut pending = Vec::new();
        for (index, block) in blocks.iter().enumerate() {
            for line in &block.lines {
                if let Some(d) = line.directive() {
                    if d.keyword == Keyword::Include && !d.args.is_empty() {
                        pending.push(PendingInclude {
                            block: index,
                            line: line.number,
                            patterns: d.args.iter().map(|t| t.text.clone()).collect(),
                        });
                    }
                }
            }
        }

        let block_count = blocks.len();
        self.files.push(SourceFile {
            id,
            path: path.to_path_buf(),
            line_ending: LineEnding::detect(&text),
            indent: detect_indent(&blocks),
            text,
            blocks,
            modified,
        });

        let mut pending = pending.into_iter().peekable();
        for index in 0..block_count {
            let block_id = BlockId { file: id, index };
            self.order.push(block_id);
            while let Some(include) = pending.next_if(|p| p.block == index) {
                self.expand(block_id, path, include);
            }
        }

        self.stack.pop();
        id
    }

    fn expand(&mut self, from: BlockId, including: &Path, include: PendingInclude) {
        let mut targets = Vec::new();

        for pattern in &include.patterns {
            let matched = match include::resolve_pattern(pattern, &self.base_dir) {
                Ok(matched) => matched,
                Err(reason) => {
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::IncludeNotFound,
                        including,
                        Some(include.line),
                        reason,
                    ));
                    continue;
                }
            };
            if matched.is_empty() {
                tracing::debug!("Include pattern '{}' matched no files", pattern);
            }

            for path in matched {
                let key = canonical(&path);
                if self.stack.contains(&key) {
                    let edge = (canonical(including), include.line, key);
                    if self.cycle_edges.insert(edge) {
                        self.diagnostics.push(Diagnostic::new(
                            DiagnosticKind::CircularInclude,
                            including,
                            Some(include.line),
                            format!("{} is already being included", path.display()),
                        ));
                    }
                    continue;
                }
                if self.seen.contains(&key) {
                    tracing::debug!("Skipping already loaded include {}", path.display());
                    continue;
                }
                if self.stack.len() >= MAX_INCLUDE_DEPTH {
                    tracing::warn!(
                        "Include depth limit reached, not loading {}",
                        path.display()
                    );
                    continue;
                }

                match fs::read_to_string(&path) {
                    Ok(text) => {
                        let modified = modified_time(&path);
                        tracing::debug!("Including {}", path.display());
                        targets.push(self.add_file(&path, text, modified));
                    }
                    Err(e) => {
                        self.diagnostics.push(Diagnostic::new(
                            DiagnosticKind::IncludeNotFound,
                            including,
                            Some(include.line),
                            format!("can't read {}: {}", path.display(), e),
                        ));
                    }
                }
            }
        }

        self.includes.push(IncludeEdge {
            from,
            line: include.line,
            patterns: include.patterns,
            files: targets,
        });
    }
}
