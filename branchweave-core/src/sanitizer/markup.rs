//! Minimal inline markup: `<tag attr="..">`, `</tag>`, `<tag/>`.
//! A `<` that is not followed by a letter or `/` is plain text ("3 < 4").

use branchweave_rules::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Open,
    Close,
    SelfClosing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupError {
    pub offset: usize,
    pub reason: String,
}

/// Elements whose inner text is dropped along with the tags when disallowed.
const DROP_WITH_CONTENT: &[&str] = &["script", "style"];

pub fn tokenize(text: &str) -> Result<Vec<Tag>, MarkupError> {
    let bytes = text.as_bytes();
    let mut tags = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let next = text[i + 1..].chars().next();
        let starts_tag = matches!(next, Some(c) if c.is_ascii_alphabetic() || c == '/');
        if !starts_tag {
            i += 1;
            continue;
        }
        let Some(rel_end) = text[i..].find('>') else {
            return Err(MarkupError { offset: i, reason: "unterminated tag".into() });
        };
        let end = i + rel_end + 1;
        let inner = &text[i + 1..end - 1];
        if inner.contains('<') {
            return Err(MarkupError { offset: i, reason: "nested '<' inside tag".into() });
        }
        let (kind, body) = if let Some(rest) = inner.strip_prefix('/') {
            (TagKind::Close, rest)
        } else if let Some(rest) = inner.strip_suffix('/') {
            (TagKind::SelfClosing, rest)
        } else {
            (TagKind::Open, inner)
        };
        let name: String = body
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        if name.is_empty() {
            return Err(MarkupError { offset: i, reason: "tag without a name".into() });
        }
        tags.push(Tag { name, kind, span: Span { start: i, end } });
        i = end;
    }
    Ok(tags)
}

/// Balanced-tag check.
pub fn check_syntax(text: &str) -> Result<(), MarkupError> {
    let tags = tokenize(text)?;
    let mut stack: Vec<&Tag> = Vec::new();
    for tag in &tags {
        match tag.kind {
            TagKind::Open => stack.push(tag),
            TagKind::SelfClosing => {}
            TagKind::Close => match stack.pop() {
                Some(open) if open.name == tag.name => {}
                Some(open) => {
                    return Err(MarkupError {
                        offset: tag.span.start,
                        reason: format!("</{}> closes <{}>", tag.name, open.name),
                    })
                }
                None => {
                    return Err(MarkupError {
                        offset: tag.span.start,
                        reason: format!("</{}> without opening tag", tag.name),
                    })
                }
            },
        }
    }
    match stack.pop() {
        Some(open) => Err(MarkupError {
            offset: open.span.start,
            reason: format!("<{}> is never closed", open.name),
        }),
        None => Ok(()),
    }
}

/// Remove tags not in `allowed`. Script-like elements lose their content as well.
/// Assumes `check_syntax` already passed; on a tokenizer error the text is returned as-is.
pub fn strip_disallowed(text: &str, allowed: &[String]) -> String {
    let Ok(tags) = tokenize(text) else {
        return text.to_string();
    };
    let is_allowed = |name: &str| allowed.iter().any(|a| a.eq_ignore_ascii_case(name));

    let mut cuts: Vec<Span> = Vec::new();
    let mut open_drop: Option<(String, usize)> = None;
    for tag in &tags {
        if let Some((name, start)) = &open_drop {
            if tag.kind == TagKind::Close && &tag.name == name {
                cuts.push(Span { start: *start, end: tag.span.end });
                open_drop = None;
            }
            continue;
        }
        if is_allowed(&tag.name) {
            continue;
        }
        if tag.kind == TagKind::Open && DROP_WITH_CONTENT.contains(&tag.name.as_str()) {
            open_drop = Some((tag.name.clone(), tag.span.start));
        } else {
            cuts.push(tag.span);
        }
    }

    let mut out = text.to_string();
    for cut in cuts.iter().rev() {
        out.replace_range(cut.start..cut.end, "");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["i".into(), "pause".into()]
    }

    #[test]
    fn plain_less_than_is_text() {
        assert!(check_syntax("3 < 4 and <i>so</i> on").is_ok());
    }

    #[test]
    fn mismatched_tags_fail() {
        assert!(check_syntax("<i>open <b>bold</i></b>").is_err());
        assert!(check_syntax("<i>never closed").is_err());
        assert!(check_syntax("broken <i").is_err());
    }

    #[test]
    fn strip_keeps_allowed_and_drops_scripts() {
        let s = "<i>Hush</i><pause/> <u>now</u><script>alert(1)</script>.";
        assert_eq!(strip_disallowed(s, &allowed()), "<i>Hush</i><pause/> now.");
        let clean = "<i>Hush</i> now.";
        assert_eq!(strip_disallowed(clean, &allowed()), clean);
    }
}
