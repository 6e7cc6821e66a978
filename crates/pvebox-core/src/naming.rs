use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

/// Tag carried by every VM this system creates.
pub const SESSION_TAG: &str = "inspect";

/// Reserved ids prefix for the long-lived built-in-template
/// infrastructure. Zones under this prefix are never torn down
/// automatically.
pub const STATIC_IDS_PREFIX: &str = "inspvm";

/// Session zone ids: 3 prefix chars, 3 digits, trailing `z`. The whole
/// id fits the hypervisor's 8-character budget with one char to spare
/// for vnet indexes.
static SESSION_ZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.{3}[0-9]{3}z$").expect("zone pattern"));

/// Zone id for an ids prefix (`abc123` -> `abc123z`).
pub fn zone_id(ids_prefix: &str) -> String {
    format!("{ids_prefix}z")
}

/// Vnet id for an ids prefix and index (`abc123`, 0 -> `abc123v0`).
pub fn vnet_id(ids_prefix: &str, index: usize) -> String {
    format!("{ids_prefix}v{index}")
}

/// True for zone ids minted by a provisioning session (as opposed to
/// operator-created zones or the static built-in zone).
pub fn is_session_zone(zone: &str) -> bool {
    SESSION_ZONE.is_match(zone)
}

/// True for ids a session is allowed to create: either the session
/// pattern or the reserved static prefix.
pub fn is_valid_zone_id(zone: &str) -> bool {
    is_session_zone(zone) || zone.starts_with(STATIC_IDS_PREFIX)
}

/// Normalize a caller-supplied stem to exactly 3 lowercase characters,
/// replacing anything outside `[a-z0-9]` with `x` and padding short
/// stems.
pub fn sanitize_stem(stem: &str) -> String {
    let mut out: String = stem
        .chars()
        .take(3)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                'x'
            }
        })
        .collect();
    while out.len() < 3 {
        out.push('x');
    }
    out
}

/// Candidate ids prefix: sanitized 3-char stem plus 3 random digits.
///
/// Uniqueness against existing zones is the caller's job; two sessions
/// can race to the same suffix, which is a documented limitation.
pub fn random_ids_prefix(stem: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{}{:03}", sanitize_stem(stem), suffix)
}

/// Deterministic content tag for a disk-image archive: derived from the
/// filename and byte size so re-imports of the same archive reuse the
/// template minted for it.
pub fn ova_tag(file_name: &str, size: u64) -> String {
    let raw = format!("ova-{file_name}-{size}");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Tag marking a built-in template, e.g. `builtin-ubuntu24.04`.
pub fn builtin_tag(name: &str) -> String {
    format!("builtin-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_and_vnet_ids_fit_budget() {
        let prefix = random_ids_prefix("mytask");
        assert_eq!(prefix.len(), 6);
        assert!(zone_id(&prefix).len() <= 8);
        assert!(vnet_id(&prefix, 9).len() <= 8);
    }

    #[test]
    fn test_is_session_zone() {
        assert!(is_session_zone("abc123z"));
        assert!(is_session_zone("x9z042z"));
        assert!(!is_session_zone("abc12z"));
        assert!(!is_session_zone("abcdefz"));
        assert!(!is_session_zone("abc123v0"));
        assert!(!is_session_zone("inspvmz"));
    }

    #[test]
    fn test_is_valid_zone_id_static_prefix() {
        assert!(is_valid_zone_id("inspvmz"));
        assert!(is_valid_zone_id("abc123z"));
        assert!(!is_valid_zone_id("randomzone"));
    }

    #[test]
    fn test_sanitize_stem() {
        assert_eq!(sanitize_stem("MyTask"), "myt");
        assert_eq!(sanitize_stem("a b"), "axb");
        assert_eq!(sanitize_stem("a"), "axx");
        assert_eq!(sanitize_stem(""), "xxx");
        assert_eq!(sanitize_stem("123456"), "123");
    }

    #[test]
    fn test_random_ids_prefix_format() {
        for _ in 0..50 {
            let p = random_ids_prefix("ctf");
            assert_eq!(p.len(), 6);
            assert!(p.starts_with("ctf"));
            assert!(p[3..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_ova_tag_sanitized() {
        assert_eq!(
            ova_tag("Ubuntu 24.04 (amd64).ova", 123456),
            "ova-ubuntu_24_04__amd64__ova-123456"
        );
    }

    #[test]
    fn test_builtin_tag() {
        assert_eq!(builtin_tag("ubuntu24.04"), "builtin-ubuntu24.04");
    }
}
