//! Property-based tests for configuration validation and persistence

use flash_incremental::prelude::*;
use proptest::prelude::*;
use std::time::Duration;

fn arb_staging_dir() -> impl Strategy<Value = String> {
    prop_oneof![
        "/[a-z]{1,8}(/[a-z]{1,8}){0,2}/{0,3}",
        "[a-z]{1,8}(/[a-z]{1,8}){0,2}/?",
        Just(String::new()),
        "/{1,3}",
    ]
}

fn arb_config() -> impl Strategy<Value = IncrementalConfig> {
    (
        0usize..8,
        0usize..8,
        prop_oneof![Just(0u64), 1u64..=u64::MAX],
        arb_staging_dir(),
        any::<bool>(),
        any::<bool>(),
        prop::collection::btree_set("[a-z_]{1,12}", 0..4),
        prop::option::of(0u64..3600),
    )
        .prop_map(
            |(diff, push, max_bytes, staging, map, wipe, branches, timeout)| IncrementalConfig {
                snapshot_mode: if map {
                    SnapshotMode::MapSnapshots
                } else {
                    SnapshotMode::ApplyUpdate
                },
                diff_parallelism: diff,
                push_parallelism: push,
                max_patch_bytes: max_bytes,
                staging_dir: staging,
                wipe_after_apply: wipe,
                allowed_branch_transitions: branches,
                push_timeout: timeout.map(Duration::from_secs),
                ..IncrementalConfig::default()
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig { max_global_rejects: 8192, ..ProptestConfig::default() })]

    #[test]
    fn prop_validate_accepts_exactly_usable_configs(config in arb_config()) {
        let staging_ok = config.staging_dir.starts_with('/')
            && !config.staging_dir.trim_end_matches('/').is_empty();
        let usable = config.diff_parallelism > 0
            && config.push_parallelism > 0
            && config.max_patch_bytes > 0
            && staging_ok;
        prop_assert_eq!(config.validate().is_ok(), usable);
    }

    #[test]
    fn prop_staging_path_has_single_trailing_slash(config in arb_config()) {
        prop_assume!(config.validate().is_ok());
        let path = config.staging_path();
        prop_assert!(path.starts_with('/'));
        prop_assert!(path.ends_with('/'));
        prop_assert!(!path.ends_with("//"));
    }

    #[test]
    fn prop_serde_preserves_config(config in arb_config()) {
        let json = serde_json::to_value(&config).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let back: IncrementalConfig =
            serde_json::from_value(json.clone()).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let again = serde_json::to_value(&back).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(json, again);
        prop_assert_eq!(back.validate().is_ok(), config.validate().is_ok());
    }
}
