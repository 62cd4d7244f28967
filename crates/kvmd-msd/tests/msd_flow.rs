//! End-to-end MSD flows against a fake gadget tree and a tempdir storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kvmd_core::Notifier;
use kvmd_msd::{incomplete_marker_path, Msd, MsdConfig, MsdError};

struct Fixture {
    _dir: tempfile::TempDir,
    storage: PathBuf,
    lun: PathBuf,
    msd: Arc<Msd>,
}

fn read_lun(lun: &Path, param: &str) -> String {
    std::fs::read_to_string(lun.join(param)).unwrap().trim().to_owned()
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("storage");
    std::fs::create_dir_all(&storage).unwrap();

    let gadget = dir.path().join("gadget");
    let lun = gadget.join("functions/mass_storage.usb0/lun.0");
    std::fs::create_dir_all(&lun).unwrap();
    std::fs::create_dir_all(gadget.join("configs/c.1/mass_storage.usb0")).unwrap();
    std::fs::write(lun.join("file"), "\n").unwrap();
    std::fs::write(lun.join("cdrom"), "0\n").unwrap();
    std::fs::write(lun.join("ro"), "1\n").unwrap();
    std::fs::write(gadget.join("UDC"), "\n").unwrap();

    let msd = Arc::new(Msd::new(
        MsdConfig {
            storage_root: storage.clone(),
            gadget_path: gadget.clone(),
            remount_cmd: Vec::new(),
            ..Default::default()
        },
        Arc::new(Notifier::new()),
    ));
    msd.refresh().await;

    Fixture {
        _dir: dir,
        storage,
        lun,
        msd,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_select_connect_cycle() {
    let fx = fixture().await;

    // Upload a 4 MiB image.
    let payload = vec![0x5Au8; 4 * 1024 * 1024];
    let mut writer = fx.msd.write_image("ubuntu.iso", payload.len() as u64, false).await.unwrap();
    for chunk in payload.chunks(65536) {
        writer.write_chunk(chunk).await.unwrap();
    }
    let written = writer.commit().await.unwrap();
    assert_eq!(written, payload.len() as u64);

    let image_path = fx.storage.join("ubuntu.iso");
    assert!(image_path.exists());
    assert!(!incomplete_marker_path(&image_path).exists());

    fx.msd.refresh().await;
    let state = fx.msd.get_state().await;
    assert!(state.online);
    assert!(state.storage.as_ref().unwrap().images.contains_key("ubuntu.iso"));

    // Select as CD-ROM and attach.
    fx.msd.set_params(Some("ubuntu.iso"), Some(true), None).await.unwrap();
    fx.msd.set_connected(true).await.unwrap();

    assert_eq!(read_lun(&fx.lun, "file"), image_path.to_string_lossy());
    assert_eq!(read_lun(&fx.lun, "cdrom"), "1");
    assert_eq!(read_lun(&fx.lun, "ro"), "1");

    // Mutations are refused while attached.
    assert!(matches!(
        fx.msd.set_params(Some(""), None, None).await,
        Err(MsdError::Connected)
    ));
    assert!(matches!(
        fx.msd.write_image("other.iso", 10, false).await.err(),
        Some(MsdError::Connected)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn incomplete_upload_leaves_marker_or_removes() {
    let fx = fixture().await;

    let mut writer = fx.msd.write_image("short.img", 1000, false).await.unwrap();
    writer.write_chunk(&[1u8; 100]).await.unwrap();
    writer.commit().await.unwrap();
    let path = fx.storage.join("short.img");
    assert!(path.exists());
    assert!(incomplete_marker_path(&path).exists());

    let mut writer = fx.msd.write_image("gone.img", 1000, true).await.unwrap();
    writer.write_chunk(&[1u8; 100]).await.unwrap();
    writer.commit().await.unwrap();
    let path = fx.storage.join("gone.img");
    assert!(!path.exists());
    assert!(!incomplete_marker_path(&path).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_streams_whole_image() {
    let fx = fixture().await;
    std::fs::write(fx.storage.join("disk.img"), vec![7u8; 200_000]).unwrap();
    fx.msd.refresh().await;

    let mut reader = fx.msd.read_image("disk.img").await.unwrap();
    assert_eq!(reader.total_size(), 200_000);
    let mut total = 0;
    while let Some(chunk) = reader.read_chunk().await.unwrap() {
        total += chunk.len();
    }
    assert_eq!(total, 200_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_region_is_exclusive() {
    let fx = fixture().await;
    std::fs::write(fx.storage.join("disk.img"), vec![7u8; 1000]).unwrap();
    fx.msd.refresh().await;

    let reader = fx.msd.read_image("disk.img").await.unwrap();
    assert!(matches!(
        fx.msd.set_connected(true).await,
        Err(MsdError::Busy)
    ));
    drop(reader);
    // After the reader is gone, the region frees up (the error changes to
    // a precondition failure since no image is selected).
    assert!(matches!(
        fx.msd.set_connected(true).await,
        Err(MsdError::ImageNotSelected)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_deletes_image_and_marker() {
    let fx = fixture().await;
    let path = fx.storage.join("junk.img");
    std::fs::write(&path, b"junk").unwrap();
    std::fs::write(incomplete_marker_path(&path), b"").unwrap();
    fx.msd.refresh().await;

    fx.msd.remove("junk.img").await.unwrap();
    assert!(!path.exists());
    assert!(!incomplete_marker_path(&path).exists());
    assert!(matches!(
        fx.msd.remove("junk.img").await,
        Err(MsdError::UnknownImage)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn initial_image_is_selected_but_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("storage");
    std::fs::create_dir_all(&storage).unwrap();
    std::fs::write(storage.join("boot.iso"), b"iso").unwrap();

    let gadget = dir.path().join("gadget");
    let lun = gadget.join("functions/mass_storage.usb0/lun.0");
    std::fs::create_dir_all(&lun).unwrap();
    std::fs::create_dir_all(gadget.join("configs/c.1/mass_storage.usb0")).unwrap();
    std::fs::write(lun.join("file"), "\n").unwrap();
    std::fs::write(lun.join("cdrom"), "0\n").unwrap();
    std::fs::write(lun.join("ro"), "1\n").unwrap();

    let msd = Arc::new(Msd::new(
        MsdConfig {
            storage_root: storage,
            gadget_path: gadget,
            remount_cmd: Vec::new(),
            initial_image: Some("boot.iso".to_owned()),
            initial_cdrom: true,
            ..Default::default()
        },
        Arc::new(Notifier::new()),
    ));
    msd.refresh().await;

    let state = msd.get_state().await;
    let drive = state.drive.unwrap();
    assert_eq!(drive.image.unwrap().name, "boot.iso");
    assert!(drive.cdrom);
    assert!(!drive.connected);
}
