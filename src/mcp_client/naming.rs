//! Server-name normalization and the qualified-identifier scheme.
//!
//! Tools and prompts are exposed as `<server>.<name>`. Resource URIs get a
//! synthetic scheme `mcp-<server>+<scheme>`, except for schemes that already
//! mean the same thing everywhere (plain web URLs). Both rewrites split on
//! the first separator only, so leaf names and original schemes may contain
//! the separator themselves.

use super::errors::McpError;

/// Separator between server name and tool/prompt name.
pub const NAME_SEPARATOR: char = '.';

/// Prefix of a qualified resource URI scheme.
pub const URI_SCHEME_PREFIX: &str = "mcp-";

/// Separator between server name and original scheme.
pub const URI_SCHEME_SEPARATOR: char = '+';

/// Schemes passed through `qualify_uri` untouched.
pub const GLOBAL_SCHEMES: &[&str] = &["http", "https"];

// ─── Server Names ────────────────────────────────────────────────────────────

/// Canonical form of a server name: trimmed, lowercase, with `.` and `_`
/// folded to `-`. Idempotent.
pub fn format_server_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '.' | '_' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Check a canonical server name: non-empty, `[a-z0-9-]` only.
pub fn validate_server_name(name: &str) -> Result<(), McpError> {
    let invalid = |reason: String| McpError::InvalidServerName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty".into()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(invalid(format!("character '{bad}' not allowed")));
    }
    Ok(())
}

/// [`format_server_name`] followed by [`validate_server_name`].
pub fn normalize_server_name(raw: &str) -> Result<String, McpError> {
    let name = format_server_name(raw);
    validate_server_name(&name)?;
    Ok(name)
}

// ─── Tool / Prompt Names ─────────────────────────────────────────────────────

pub fn qualify_name(server: &str, name: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{name}")
}

/// Split `<server>.<name>` on the first separator.
pub fn split_qualified_name(identifier: &str) -> Result<(&str, &str), McpError> {
    let invalid = |reason: &str| McpError::InvalidQualifiedName {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    };

    let (server, name) = identifier
        .split_once(NAME_SEPARATOR)
        .ok_or_else(|| invalid("missing '.' between server and name"))?;
    if server.is_empty() {
        return Err(invalid("empty server name"));
    }
    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    Ok((server, name))
}

// ─── Resource URIs ───────────────────────────────────────────────────────────

fn is_global_scheme(scheme: &str) -> bool {
    GLOBAL_SCHEMES
        .iter()
        .any(|global| global.eq_ignore_ascii_case(scheme))
}

/// Rewrite `uri` into the namespace of `server`.
///
/// `datetime://Africa/Algiers/now` on `timeserver` becomes
/// `mcp-timeserver+datetime://Africa/Algiers/now`; `https://...` is returned
/// unchanged.
pub fn qualify_uri(server: &str, uri: &str) -> Result<String, McpError> {
    let (scheme, _) = uri
        .split_once(':')
        .filter(|(scheme, _)| !scheme.is_empty())
        .ok_or_else(|| McpError::InvalidQualifiedName {
            identifier: uri.to_string(),
            reason: "resource URI has no scheme".into(),
        })?;

    if is_global_scheme(scheme) {
        return Ok(uri.to_string());
    }
    Ok(format!("{URI_SCHEME_PREFIX}{server}{URI_SCHEME_SEPARATOR}{uri}"))
}

/// Invert [`qualify_uri`]: return the owning server (normalized) and the
/// original URI.
pub fn unqualify_uri(qualified: &str) -> Result<(String, String), McpError> {
    let invalid = |reason: &str| McpError::InvalidQualifiedName {
        identifier: qualified.to_string(),
        reason: reason.to_string(),
    };

    let (scheme, _) = qualified
        .split_once(':')
        .ok_or_else(|| invalid("missing scheme"))?;
    let rest = scheme
        .strip_prefix(URI_SCHEME_PREFIX)
        .ok_or_else(|| invalid("scheme is not a qualified 'mcp-<server>+<scheme>'"))?;
    let (server, original_scheme) = rest
        .split_once(URI_SCHEME_SEPARATOR)
        .ok_or_else(|| invalid("missing '+' between server and original scheme"))?;
    if original_scheme.is_empty() {
        return Err(invalid("empty original scheme"));
    }
    let canonical = format_server_name(server);
    validate_server_name(&canonical)?;

    let original = &qualified[URI_SCHEME_PREFIX.len() + server.len() + 1..];
    Ok((canonical, original.to_string()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
