//! Canonical GID handling for store-owned entities.
//!
//! External entity ids are persisted in the canonical form
//! `gid://store/<Type>/<number>`. Numeric-only ids are accepted on input and
//! normalized; queue external ids additionally strip characters the broker
//! rejects.

const GID_PREFIX: &str = "gid://store/";

/// Build a canonical GID from a type name and numeric id.
pub fn gid(kind: &str, id: u64) -> String {
    format!("{GID_PREFIX}{kind}/{id}")
}

/// Normalize an id for `kind`: canonical GIDs pass through, numeric ids are
/// wrapped, and GIDs of the wrong type are re-typed around their numeric
/// tail. Anything else is returned unchanged.
pub fn normalize(kind: &str, raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with(GID_PREFIX) && raw[GID_PREFIX.len()..].starts_with(kind) {
        let rest = &raw[GID_PREFIX.len() + kind.len()..];
        if rest.starts_with('/') && rest[1..].chars().all(|c| c.is_ascii_digit()) {
            return raw.to_string();
        }
    }
    if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
        return format!("{GID_PREFIX}{kind}/{raw}");
    }
    match numeric_tail(raw) {
        Some(n) => format!("{GID_PREFIX}{kind}/{n}"),
        None => raw.to_string(),
    }
}

/// The trailing numeric segment of a GID-shaped string, if any.
pub fn numeric_tail(raw: &str) -> Option<&str> {
    let tail = raw.rsplit('/').next()?;
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(tail)
    } else {
        None
    }
}

/// Sanitize a string for use inside a broker external id. The broker rejects
/// colons, so they are stripped.
pub fn sanitize_for_queue(raw: &str) -> String {
    raw.chars().filter(|c| *c != ':').collect()
}
