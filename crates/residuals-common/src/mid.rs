//! Merchant identifier helpers.

/// Prefix that a historical double import prepended to merchant ids.
pub const LEGACY_MID_PREFIX: &str = "00";

/// Trim and drop embedded whitespace and dashes so `"2266-0744 "` and
/// `"22660744"` compare equal.
pub fn normalize_mid(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

pub fn is_legacy_prefixed(mid: &str) -> bool {
    mid.starts_with(LEGACY_MID_PREFIX)
}

/// The identifier the duplicated copy of `mid` carries.
pub fn prefixed_sibling(mid: &str) -> String {
    format!("{LEGACY_MID_PREFIX}{mid}")
}
