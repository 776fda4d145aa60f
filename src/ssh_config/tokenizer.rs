//! Splits raw ssh_config text into lines, keeping byte spans so untouched
//! text can be copied back verbatim.

use std::ops::Range;
use std::path::Path;

use super::error::{Diagnostic, DiagnosticKind};
use super::model::{Directive, Keyword, Line, LineKind, Token};

/// Tokenize a whole file. Never fails: problems become `MalformedLine`
/// diagnostics and the offending line is kept as well as it can be.
pub(crate) fn tokenize(text: &str, path: &Path, diagnostics: &mut Vec<Diagnostic>) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut number = 0;

    while start < text.len() {
        number += 1;
        let (content_end, end) = match text[start..].find('\n') {
            Some(rel) => {
                let newline = start + rel;
                let content_end = if newline > start && text.as_bytes()[newline - 1] == b'\r' {
                    newline - 1
                } else {
                    newline
                };
                (content_end, newline + 1)
            }
            None => (text.len(), text.len()),
        };
        let span = start..content_end;
        let kind = parse_line(text, span.clone(), number, path, diagnostics);
        lines.push(Line {
            number,
            span,
            end,
            kind,
        });
        start = end;
    }

    lines
}

fn parse_line(
    text: &str,
    span: Range<usize>,
    number: usize,
    path: &Path,
    diagnostics: &mut Vec<Diagnostic>,
) -> LineKind {
    let raw = &text[span.clone()];
    let body = raw.trim_start();
    if body.trim_end().is_empty() {
        return LineKind::Blank;
    }
    if body.starts_with('#') {
        return LineKind::Comment;
    }

    let indent_len = raw.len() - body.len();
    let keyword_len = body
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(body.len());
    if keyword_len == 0 {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::MalformedLine,
            path,
            Some(number),
            "line has no keyword",
        ));
        return LineKind::Unparsed;
    }
    let name = &body[..keyword_len];

    // Separator: whitespace, or a single '=' with optional whitespace around it.
    let rest = &body[keyword_len..];
    let after_ws = rest.trim_start_matches([' ', '\t']);
    let after_sep = match after_ws.strip_prefix('=') {
        Some(after_eq) => after_eq.trim_start_matches([' ', '\t']),
        None => after_ws,
    };
    let value_start = span.start + indent_len + keyword_len + (rest.len() - after_sep.len());

    let split = split_args(text, value_start..span.end);
    if let Some(message) = &split.error {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::MalformedLine,
            path,
            Some(number),
            message.clone(),
        ));
    } else if split.args.is_empty() {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::MalformedLine,
            path,
            Some(number),
            format!("{} has no value", name),
        ));
    }

    let value_span = value_start..split.value_end;
    LineKind::Directive(Directive {
        keyword: Keyword::parse(name),
        name: name.to_string(),
        value: text[value_span.clone()].to_string(),
        args: split.args,
        comment: split.comment.map(|range| text[range].to_string()),
        indent: raw[..indent_len].to_string(),
        value_span,
    })
}

/// The arguments `value` would read back as if written after a keyword.
/// `Err` when part of it would turn into a comment or a quote is left open.
pub(crate) fn value_args(value: &str) -> Result<Vec<String>, String> {
    let split = split_args(value, 0..value.len());
    if let Some(error) = split.error {
        return Err(error);
    }
    if split.comment.is_some() {
        return Err("an unquoted '#' would start a comment".to_string());
    }
    Ok(split.args.into_iter().map(|t| t.text).collect())
}

struct ArgSplit {
    args: Vec<Token>,
    /// End of the last argument; the value span stops here.
    value_end: usize,
    comment: Option<Range<usize>>,
    error: Option<String>,
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Split a value into arguments the way ssh does: whitespace separates,
/// double quotes group (with `\"` and `\\` escapes), and an unquoted `#` at
/// the start of an argument begins a comment.
fn split_args(text: &str, range: Range<usize>) -> ArgSplit {
    let end = range.end;
    let mut args = Vec::new();
    let mut value_end = range.start;
    let mut pos = range.start;

    loop {
        while let Some(c) = text[pos..end].chars().next() {
            if !is_blank(c) {
                break;
            }
            pos += c.len_utf8();
        }
        if pos >= end {
            break;
        }
        if text[pos..end].starts_with('#') {
            return ArgSplit {
                args,
                value_end,
                comment: Some(pos..end),
                error: None,
            };
        }

        let token_start = pos;
        let mut buf = String::new();
        let mut quoted = false;
        while let Some(c) = text[pos..end].chars().next() {
            if is_blank(c) {
                break;
            }
            if c != '"' {
                buf.push(c);
                pos += c.len_utf8();
                continue;
            }

            quoted = true;
            pos += 1;
            let mut closed = false;
            while let Some(c) = text[pos..end].chars().next() {
                match c {
                    '\\' if matches!(text[pos + 1..end].chars().next(), Some('"' | '\\')) => {
                        buf.push(text.as_bytes()[pos + 1] as char);
                        pos += 2;
                    }
                    '"' => {
                        pos += 1;
                        closed = true;
                        break;
                    }
                    other => {
                        buf.push(other);
                        pos += other.len_utf8();
                    }
                }
            }
            if !closed {
                // Keep the rest of the line as one literal argument.
                let literal_end = token_start + text[token_start..end].trim_end().len();
                args.push(Token {
                    text: text[token_start..literal_end].to_string(),
                    quoted: false,
                    span: token_start..literal_end,
                });
                return ArgSplit {
                    args,
                    value_end: literal_end,
                    comment: None,
                    error: Some("unterminated quote".to_string()),
                };
            }
        }

        args.push(Token {
            text: buf,
            quoted,
            span: token_start..pos,
        });
        value_end = pos;
    }

    ArgSplit {
        args,
        value_end,
        comment: None,
        error: None,
    }
}
