//! Atomic writes through the real filesystem.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use tilevault_atomic::fs_hooks::{
    recover_displaced_target, sha256_hex, DisplacedTargetRecovery, FsAtomicWriteHooks, StagedFile,
};
use tilevault_atomic::manifest::{ExpectedFile, ManifestState};
use tilevault_core::error::Error;
use tilevault_test_utils::{assert_committed, TestContext};

fn tile_hooks() -> FsAtomicWriteHooks {
    FsAtomicWriteHooks::new(vec![
        StagedFile::new("0/0/0.png", &b"tile-0"[..]),
        StagedFile::new("1/0/1.png", &b"tile-1"[..]),
        StagedFile::new("metadata.json", &br#"{"format":"png"}"#[..]),
    ])
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn files_appear_at_target_after_commit() {
    let ctx = TestContext::new();
    let hooks = tile_hooks();
    let request = ctx.request_with_files("maps/m1/tiles", hooks.expected_files());
    let tmp_dir = request.tmp_dir.clone();

    let outcome = ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap();
    assert_committed(&outcome.manifest);

    let target = ctx.path().join("maps/m1/tiles");
    assert_eq!(read(&target.join("0/0/0.png")), b"tile-0");
    assert_eq!(read(&target.join("1/0/1.png")), b"tile-1");
    assert_eq!(read(&target.join("metadata.json")), br#"{"format":"png"}"#);
    assert!(!Path::new(&tmp_dir).exists(), "staging directory should be renamed away");
}

#[tokio::test]
async fn existing_target_is_replaced_whole() {
    let ctx = TestContext::new();
    let target = ctx.path().join("maps/m1/tiles");
    std::fs::create_dir_all(target.join("9")).unwrap();
    std::fs::write(target.join("9/stale.png"), b"old").unwrap();

    let hooks = tile_hooks();
    let request = ctx.request_with_files("maps/m1/tiles", hooks.expected_files());
    ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap();

    assert!(!target.join("9/stale.png").exists());
    assert_eq!(read(&target.join("0/0/0.png")), b"tile-0");

    let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "displaced target not removed: {leftovers:?}");
}

/// Leaves `maps/m1/tiles` as a crash between the two renames would: the old
/// target moved aside and recorded in the marker, nothing at the target.
fn crash_mid_replacement(ctx: &TestContext) -> std::path::PathBuf {
    let parent = ctx.path().join("maps/m1");
    let aside = parent.join(".tiles.replaced-01HZZZZZZZZZZZZZZZZZZZZZZZ");
    std::fs::create_dir_all(&aside).unwrap();
    std::fs::write(aside.join("keep.png"), b"current").unwrap();
    std::fs::write(
        parent.join(".tiles.replacing"),
        ".tiles.replaced-01HZZZZZZZZZZZZZZZZZZZZZZZ",
    )
    .unwrap();
    parent.join("tiles")
}

#[tokio::test]
async fn crash_between_renames_is_recoverable() {
    let ctx = TestContext::new();
    let target = crash_mid_replacement(&ctx);
    assert!(!target.exists());

    let outcome = recover_displaced_target(&target).await.unwrap();
    assert_eq!(outcome, DisplacedTargetRecovery::Restored);
    assert_eq!(read(&target.join("keep.png")), b"current");
}

#[tokio::test]
async fn next_write_heals_an_interrupted_replacement() {
    let ctx = TestContext::new();
    let target = crash_mid_replacement(&ctx);

    let hooks = tile_hooks();
    let request = ctx.request_with_files("maps/m1/tiles", hooks.expected_files());
    ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap();

    assert_eq!(read(&target.join("0/0/0.png")), b"tile-0");
    assert!(!target.join("keep.png").exists());
    let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "recovery left entries behind: {leftovers:?}");
}

#[tokio::test]
async fn checksum_mismatch_never_touches_target() {
    let ctx = TestContext::new();
    let target = ctx.path().join("maps/m1/tiles");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("keep.png"), b"current").unwrap();

    let hooks = tile_hooks();
    let mut expected = hooks.expected_files();
    expected[0] = ExpectedFile::new("0/0/0.png", sha256_hex(b"something else"));
    let request = ctx.request_with_files("maps/m1/tiles", expected);

    let err = ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap_err();
    assert!(
        matches!(err, Error::HookFailed { step: "write_files", .. }),
        "unexpected error: {err}"
    );

    assert_eq!(read(&target.join("keep.png")), b"current");
    assert!(!target.join("0/0/0.png").exists());

    let pending = ctx
        .subsystem
        .manifests()
        .list_by_state(ManifestState::Pending)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn missing_expected_file_fails_the_write() {
    let ctx = TestContext::new();
    let hooks = tile_hooks();
    let mut expected = hooks.expected_files();
    expected.push(ExpectedFile::new("2/1/1.png", sha256_hex(b"never written")));
    let request = ctx.request_with_files("maps/m1/tiles", expected);

    let err = ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap_err();
    match err {
        Error::HookFailed { step, source } => {
            assert_eq!(step, "write_files");
            assert!(matches!(*source, Error::Io { .. }), "unexpected source: {source}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn map_tiles_request_uses_the_storage_layout() {
    let ctx = TestContext::new();
    let project = tilevault_core::ProjectId::new("acme").unwrap();
    let map = tilevault_core::MapId::new("basemap").unwrap();
    let hooks = tile_hooks();

    let request = ctx.subsystem.map_tiles_request(
        &project,
        &map,
        "tile_import",
        "importer",
        hooks.expected_files(),
    );
    let layout = ctx.subsystem.handles().layout();
    assert!(Path::new(&request.tmp_dir).starts_with(layout.map_tmp_root(&project, &map)));

    ctx.subsystem.execute_atomic_write(request, &hooks).await.unwrap();
    let tiles = layout.map_tiles_root(&project, &map);
    assert_eq!(read(&tiles.join("0/0/0.png")), b"tile-0");
}
