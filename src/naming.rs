//! Deterministic remote resource names derived from logical identifiers.
//!
//! App and machine names are the identifier behind a fixed prefix. Volume
//! names are additionally restricted to `[A-Za-z0-9_]` and capped at
//! [`MAX_VOLUME_NAME_LEN`] characters. When the sanitised name would exceed
//! the cap, the tail is replaced by a short SHA-256 digest of the full
//! identifier so long identifiers sharing a prefix stay distinct.
//!
//! Identifiers that differ only in characters stripped by sanitisation (for
//! example `a-b` and `ab`) still map to the same volume name. Callers must
//! not rely on volume names to distinguish such identifiers.

use sha2::{Digest, Sha256};

/// Prefix applied to app and machine names.
pub const RESOURCE_PREFIX: &str = "devbox-";

/// Prefix applied to volume names.
pub const VOLUME_PREFIX: &str = "devbox_";

/// Longest volume name accepted by the provider.
pub const MAX_VOLUME_NAME_LEN: usize = 30;

const DIGEST_CHARS: usize = 8;

/// Returns the app or machine name for `identifier`.
#[must_use]
pub fn resource_name(identifier: &str) -> String {
    format!("{RESOURCE_PREFIX}{identifier}")
}

/// Returns the volume name for `identifier`.
#[must_use]
pub fn volume_name(identifier: &str) -> String {
    let sanitized: String = format!("{VOLUME_PREFIX}{identifier}")
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .collect();
    if sanitized.len() <= MAX_VOLUME_NAME_LEN {
        return sanitized;
    }

    let digest = format!("{:x}", Sha256::digest(identifier.as_bytes()));
    let keep = MAX_VOLUME_NAME_LEN - DIGEST_CHARS - 1;
    let mut name: String = sanitized.chars().take(keep).collect();
    name.push('_');
    name.extend(digest.chars().take(DIGEST_CHARS));
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc123", "devbox-abc123")]
    #[case("", "devbox-")]
    fn resource_name_prefixes_identifier(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(resource_name(input), expected);
    }

    #[rstest]
    #[case("project", "devbox_project")]
    #[case("my-project.v2", "devbox_myprojectv2")]
    #[case("ünïcode", "devbox_ncode")]
    fn volume_name_strips_disallowed_characters(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(volume_name(input), expected);
    }

    #[rstest]
    fn volume_name_at_limit_is_untouched() {
        let input = "a".repeat(MAX_VOLUME_NAME_LEN - VOLUME_PREFIX.len());
        let name = volume_name(&input);
        assert_eq!(name, format!("{VOLUME_PREFIX}{input}"));
    }

    #[rstest]
    fn long_names_with_shared_prefix_do_not_collide() {
        let first = volume_name("workspace-with-a-very-long-name-alpha");
        let second = volume_name("workspace-with-a-very-long-name-beta");
        assert_eq!(first.len(), MAX_VOLUME_NAME_LEN);
        assert_eq!(second.len(), MAX_VOLUME_NAME_LEN);
        assert_ne!(first, second);
    }

    #[rstest]
    fn truncated_names_are_stable() {
        let input = "x".repeat(64);
        assert_eq!(volume_name(&input), volume_name(&input));
    }
}
