use super::model::{Block, BlockKind, Token};

/// The patterns of a `Host` line: the first is the nickname, the rest are
/// aliases that share the block.
#[derive(Debug, Clone, Copy)]
pub struct HostHeader<'a> {
    tokens: &'a [Token],
}

impl<'a> HostHeader<'a> {
    pub fn tokens(&self) -> &'a [Token] {
        self.tokens
    }

    pub fn nickname(&self) -> Option<&'a str> {
        self.tokens.first().map(|t| t.text.as_str())
    }

    pub fn aliases(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.tokens.iter().skip(1).map(|t| t.text.as_str())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.tokens.iter().map(|t| t.text.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t.text == name)
    }
}

impl Block {
    /// The header of a `Host` block. `None` for `Match` and global blocks.
    pub fn host_header(&self) -> Option<HostHeader<'_>> {
        if self.kind != BlockKind::Host {
            return None;
        }
        self.header().map(|d| HostHeader { tokens: &d.args })
    }
}

/// Render a single token, quoting it when it holds whitespace, is empty or
/// would otherwise read as a comment.
pub fn quote_token(text: &str) -> String {
    if !text.is_empty()
        && !text.starts_with('#')
        && !text.chars().any(|c| c.is_whitespace() || c == '"')
    {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Render a replacement for an existing token. A token that was quoted
/// stays quoted even if the new text doesn't need it.
pub(crate) fn render_token(text: &str, keep_quoted: bool) -> String {
    if keep_quoted && !text.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", text)
    } else {
        quote_token(text)
    }
}

/// Check that `name` can be a nickname or alias of a connectable host.
/// `Err` carries the reason.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("name can't be empty".to_string());
    }
    if name != name.trim() {
        return Err("name can't start or end with whitespace".to_string());
    }
    if name.contains(['*', '?']) {
        return Err("wildcards make the block a pattern rule".to_string());
    }
    if name.starts_with('!') {
        return Err("a leading '!' makes the block a pattern rule".to_string());
    }
    if name.contains(['#', '"', '\\']) {
        return Err("'#', '\"' and '\\' are not allowed".to_string());
    }
    if name.contains(['\n', '\r']) {
        return Err("name must fit on one line".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh_config::model::ConfigDocument;
    use std::path::Path;

    fn first_block(content: &str) -> Block {
        let doc = ConfigDocument::from_text(Path::new("/tmp/test_config"), content);
        doc.files()[0].blocks[0].clone()
    }

    #[test]
    fn test_host_header_nickname_and_aliases() {
        let block = first_block("Host web1 \"web one\" w1\n  HostName 10.0.0.1\n");
        let header = block.host_header().unwrap();
        assert_eq!(header.nickname(), Some("web1"));
        assert_eq!(header.aliases().collect::<Vec<_>>(), vec!["web one", "w1"]);
        assert!(header.contains("web one"));
        assert!(!header.contains("web"));
    }

    #[test]
    fn test_match_block_has_no_host_header() {
        let block = first_block("Match host *.corp\n  User me\n");
        assert!(block.host_header().is_none());
    }

    #[test]
    fn test_quote_token() {
        assert_eq!(quote_token("web1"), "web1");
        assert_eq!(quote_token("nick name"), "\"nick name\"");
        assert_eq!(quote_token(""), "\"\"");
        assert_eq!(quote_token("tab\there"), "\"tab\there\"");
        assert_eq!(quote_token("#x"), "\"#x\"");
        assert_eq!(quote_token("a#b"), "a#b");
    }

    #[test]
    fn test_render_token_keeps_quotes() {
        assert_eq!(render_token("jump1", true), "\"jump1\"");
        assert_eq!(render_token("jump1", false), "jump1");
        assert_eq!(render_token("jump one", false), "\"jump one\"");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-1.example").is_ok());
        assert!(validate_name("my server").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("  ").is_err());
        assert!(validate_name(" padded").is_err());
        assert!(validate_name("web*").is_err());
        assert!(validate_name("web?").is_err());
        assert!(validate_name("!web").is_err());
        assert!(validate_name("a#b").is_err());
        assert!(validate_name("say\"hi").is_err());
    }
}
