//! Property tests for remote resource naming.

use fly_provider::naming::{
    MAX_VOLUME_NAME_LEN, RESOURCE_PREFIX, VOLUME_PREFIX, resource_name, volume_name,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn volume_names_respect_charset_and_length(identifier in "\\PC{0,80}") {
        let name = volume_name(&identifier);
        prop_assert!(name.len() <= MAX_VOLUME_NAME_LEN, "too long: {name}");
        prop_assert!(
            name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'),
            "bad character in {name}"
        );
        prop_assert!(name.starts_with(VOLUME_PREFIX));
    }

    #[test]
    fn volume_names_are_deterministic(identifier in "[a-z0-9-]{0,64}") {
        prop_assert_eq!(volume_name(&identifier), volume_name(&identifier));
    }

    #[test]
    fn resource_names_keep_identifier_after_prefix(identifier in "[a-z0-9-]{1,40}") {
        let name = resource_name(&identifier);
        prop_assert_eq!(name.strip_prefix(RESOURCE_PREFIX), Some(identifier.as_str()));
    }
}
