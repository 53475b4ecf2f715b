//! Bootloader and baseband handling around an incremental update

mod common;

use common::*;
use flash_incremental::flashing::{
    BOOTLOADER_STAGING_DIR, update_bootloader_from_userspace,
};
use flash_incremental::prelude::*;
use flash_pack_header::write_pack;

fn slotted_device() -> FakeDevice {
    let device = FakeDevice::new();
    device.set_property("ro.product.ab_ota_partitions", "abl,bl1,system,vendor");
    device.set_property("ro.boot.slot_suffix", "_a");
    device
}

fn pack(dir: &std::path::Path) -> Result<std::path::PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join("bootloader.img");
    write_pack(
        &path,
        "gs201",
        "slider-1.3-1111111",
        &[("abl", b"abl-2"), ("bl1", b"bl1-2"), ("ldfw", b"ldfw-2")],
    )?;
    Ok(path)
}

#[tokio::test]
async fn test_userspace_bootloader_writes_inactive_slot() -> TestResult {
    let dir = tempfile::tempdir()?;
    let pack = pack(dir.path())?;
    let device = slotted_device();

    update_bootloader_from_userspace(&device, &pack, Some(dir.path())).await?;

    let mut remotes: Vec<String> = device.pushed().into_iter().map(|(_, r, _)| r).collect();
    remotes.sort();
    assert_eq!(
        remotes,
        [
            format!("{BOOTLOADER_STAGING_DIR}abl.img"),
            format!("{BOOTLOADER_STAGING_DIR}bl1.img"),
        ]
    );
    assert!(device.ran_shell("mkdir -p /data/bootloader/"));
    assert!(device.ran_shell("dd if=/data/bootloader/abl.img of=/dev/block/by-name/abl_b"));
    assert!(device.ran_shell("dd if=/data/bootloader/bl1.img of=/dev/block/by-name/bl1_b"));
    assert!(!device.shell_commands().iter().any(|c| c.contains("ldfw")));
    Ok(())
}

#[tokio::test]
async fn test_userspace_bootloader_rejects_unknown_slot() -> TestResult {
    let dir = tempfile::tempdir()?;
    let pack = pack(dir.path())?;
    let device = slotted_device();
    device.set_property("ro.boot.slot_suffix", "_c");

    let err = update_bootloader_from_userspace(&device, &pack, Some(dir.path()))
        .await
        .err()
        .ok_or("unexpected slot should fail")?;
    assert!(err.to_string().contains("unexpected ro.boot.slot_suffix: _c"));
    assert!(device.pushed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_userspace_bootloader_requires_partition_list() -> TestResult {
    let dir = tempfile::tempdir()?;
    let pack = pack(dir.path())?;
    let device = FakeDevice::new();

    let err = update_bootloader_from_userspace(&device, &pack, Some(dir.path()))
        .await
        .err()
        .ok_or("missing property should fail")?;
    assert!(err.to_string().contains("Couldn't query ab_ota_partitions"));
    Ok(())
}

#[tokio::test]
async fn test_failed_dd_is_a_setup_error() -> TestResult {
    let dir = tempfile::tempdir()?;
    let pack = pack(dir.path())?;
    let device = slotted_device();
    device.respond("dd if=", CommandResult::failed("No space left on device"));

    let err = update_bootloader_from_userspace(&device, &pack, Some(dir.path()))
        .await
        .err()
        .ok_or("dd failure should fail")?;
    assert_eq!(err.identifier(), Some(ErrorIdentifier::IncrementalFlashingError));
    assert!(err.to_string().contains("No space left on device"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_session_uses_userspace_bootloader_when_enabled() -> TestResult {
    let fixture = Fixture::new()?;
    let pack = pack(fixture.root.path())?;
    let device = slotted_device();
    let manager = fixture.manager(
        fixture
            .config()
            .update_bootloader_from_userspace(true)
            .build()?,
    )?;
    let mut session = manager
        .initialize(&device, &fixture.target_build())
        .await?
        .ok_or("device should be eligible")?;

    session
        .update_device(&device, Some(&pack), Some(&fixture.target_baseband))
        .await?;

    assert!(device.ran_shell("dd if=/data/bootloader/abl.img of=/dev/block/by-name/abl_b"));
    assert!(device.position("fastboot:flash bootloader").is_none());
    assert!(device.position("fastboot:flash radio").is_some());

    session.clean_after_setup().await;
    assert!(fixture.work_root_is_empty()?);
    Ok(())
}
