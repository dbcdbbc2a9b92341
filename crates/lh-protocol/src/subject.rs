// Routing subjects and wildcard pattern matching.
//
// Subjects are dot-separated lowercase tokens. Patterns may use `*` to match
// exactly one token and a trailing `>` to match one or more tokens.

use crate::canonical::CanonicalEvent;

/// Well-known subject for accepted webhook deliveries.
pub const RAW_SUBJECT: &str = "langhook.raw";
/// Prefix of every canonical event subject.
pub const EVENTS_PREFIX: &str = "langhook.events";
/// Dead-letter subject for canonicalisation failures.
pub const MAP_FAIL_SUBJECT: &str = "langhook.map_fail";

/// Subject a canonical event is published on:
/// `langhook.events.<publisher>.<resource_type>.<resource_id>.<action>`.
pub fn event_subject(event: &CanonicalEvent) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        EVENTS_PREFIX,
        sanitize_token(&event.publisher),
        sanitize_token(&event.resource.kind),
        sanitize_token(&event.resource.id.to_string()),
        event.action,
    )
}

/// Fold an arbitrary value into a legal subject token: lowercase, with the
/// dot-grammar separators and whitespace replaced by `_`.
pub fn sanitize_token(raw: &str) -> String {
    let token: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '/' | '#' | ' ' | '\t' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    if token.is_empty() { "_".to_owned() } else { token }
}

/// Match a subject against a pattern with `*` (one token) and trailing `>`
/// (one or more tokens) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.').peekable();

    loop {
        match (pat.next(), sub.peek()) {
            (Some(">"), Some(_)) => {
                // `>` must be the last pattern token; it swallows the rest.
                return pat.next().is_none();
            }
            (Some(">"), None) => return false,
            (Some(p), Some(&s)) => {
                if p != "*" && p != s {
                    return false;
                }
                sub.next();
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}
