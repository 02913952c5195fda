//! Pulling a reply text out of a backend response body.
//!
//! The backend's schema has changed between versions, so extraction is a
//! prioritized list of field names tried against the `data` object (when
//! present) and then the root object.  The first string hit wins.  The
//! result is flattened from Markdown to plain text because the platform
//! renders simpleText verbatim.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::util::truncate_chars;

/// Field names tried in order.
pub const REPLY_FIELDS: &[&str] = &["response", "answer", "text", "message"];

/// Longest raw body excerpt kept for diagnostics or returned as a last resort.
pub const SNIPPET_CHARS: usize = 200;

/// Extract the reply from a JSON body.  Returns `None` when the body is not
/// JSON or no rule matches; callers decide what to fall back to.
pub fn extract_reply(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let root = json.as_object()?;
    let mut scopes = Vec::with_capacity(2);
    if let Some(data) = root.get("data").and_then(Value::as_object) {
        scopes.push(data);
    }
    scopes.push(root);
    for scope in scopes {
        for field in REPLY_FIELDS {
            if let Some(text) = scope.get(*field).and_then(Value::as_str) {
                return Some(markdown_to_plain(text.trim()));
            }
        }
    }
    None
}

/// First `SNIPPET_CHARS` characters of a body.
pub fn snippet(body: &str) -> String {
    truncate_chars(body, SNIPPET_CHARS).to_string()
}

static CODE_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*```[^\n]*\n?").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s+").unwrap());
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").unwrap());
static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").unwrap());
static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__)(.+?)(\*\*|__)").unwrap());
static ITALIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\w*])\*([^*\n]+)\*([^\w*]|$)").unwrap());
static INLINE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(\s*)[*+-]\s+").unwrap());
static QUOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*>\s?").unwrap());
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Flatten common Markdown constructs.  Links keep their target in
/// parentheses since the platform does not render anchors.
pub fn markdown_to_plain(text: &str) -> String {
    let out = CODE_FENCE_RE.replace_all(text, "");
    let out = HEADING_RE.replace_all(&out, "");
    let out = IMAGE_RE.replace_all(&out, "$1 ($2)");
    let out = LINK_RE.replace_all(&out, "$1 ($2)");
    let out = BOLD_RE.replace_all(&out, "$2");
    let out = ITALIC_RE.replace_all(&out, "$1$2$3");
    let out = INLINE_CODE_RE.replace_all(&out, "$1");
    let out = BULLET_RE.replace_all(&out, "$1• ");
    let out = QUOTE_RE.replace_all(&out, "");
    let out = BLANK_RUN_RE.replace_all(&out, "\n\n");
    out.trim().to_string()
}
