//! Property tests for cleanup planning.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use tilevault_atomic::cleanup::{build_manifest_cleanup_plan, KeepReason, TmpDirectoryInfo};
use tilevault_atomic::manifest::ManifestState;

fn state_strategy() -> impl Strategy<Value = Option<ManifestState>> {
    prop_oneof![
        Just(None),
        Just(Some(ManifestState::Pending)),
        Just(Some(ManifestState::Committed)),
        Just(Some(ManifestState::Aborted)),
    ]
}

fn created_at_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("not-a-timestamp".to_string())),
        (0i64..200_000).prop_map(|age_secs| {
            let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            Some((now - chrono::Duration::seconds(age_secs)).to_rfc3339())
        }),
    ]
}

fn info_strategy() -> impl Strategy<Value = TmpDirectoryInfo> {
    (any::<u16>(), state_strategy(), created_at_strategy()).prop_map(|(n, state, created_at)| {
        TmpDirectoryInfo {
            path: PathBuf::from(format!("/tmp/op-{n}")),
            manifest_id: Some(i64::from(n)),
            manifest_state: state,
            created_at,
        }
    })
}

proptest! {
    #[test]
    fn every_directory_lands_in_exactly_one_bucket(
        infos in prop::collection::vec(info_strategy(), 0..40),
        window_secs in 0u64..172_800,
    ) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let plan = build_manifest_cleanup_plan(now, Duration::from_secs(window_secs), infos.clone());

        prop_assert_eq!(plan.considered, infos.len());
        prop_assert_eq!(plan.to_delete.len() + plan.to_keep.len(), infos.len());
    }

    #[test]
    fn pending_and_unparseable_are_never_deleted(
        infos in prop::collection::vec(info_strategy(), 0..40),
        window_secs in 0u64..172_800,
    ) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let window = chrono::Duration::seconds(i64::try_from(window_secs).unwrap());
        let plan = build_manifest_cleanup_plan(now, Duration::from_secs(window_secs), infos);

        for deleted in &plan.to_delete {
            prop_assert_ne!(deleted.manifest_state, Some(ManifestState::Pending));
            let created = chrono::DateTime::parse_from_rfc3339(
                deleted.created_at.as_deref().unwrap_or_default(),
            );
            prop_assert!(created.is_ok());
            prop_assert!(now.signed_duration_since(created.unwrap()) > window);
        }
        for kept in &plan.to_keep {
            if kept.info.manifest_state == Some(ManifestState::Pending) {
                prop_assert_eq!(kept.reason, KeepReason::Pending);
            }
        }
    }
}
