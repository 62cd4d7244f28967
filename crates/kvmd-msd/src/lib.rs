//! Mass-storage emulation: an image store on a dedicated partition plus
//! the USB-gadget LUN that presents a selected image to the managed host
//! as a flash drive or CD-ROM.

mod drive;
mod io;
mod remount;
mod storage;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use kvmd_core::{ApiError, ExclusiveRegion, Notifier, RegionGuard, NOTIFY_CHANGED, NOTIFY_FULL};

pub use drive::Drive;
pub use io::TransferState;
pub use remount::Remounter;
pub use storage::{incomplete_marker_path, set_complete, ImageInfo, PartInfo, Storage, StorageState};

#[derive(Debug, Error)]
pub enum MsdError {
    #[error("performing another MSD operation, please try again later")]
    Busy,
    #[error("MSD is not found")]
    Offline,
    #[error("MSD is connected to the host, but shouldn't be for this operation")]
    Connected,
    #[error("MSD is disconnected from the host, but should be for this operation")]
    Disconnected,
    #[error("the image is not selected")]
    ImageNotSelected,
    #[error("the image is not found in the storage")]
    UnknownImage,
    #[error("this image already exists")]
    ImageExists,
    #[error("MSD drive is locked by an IO operation")]
    DriveLocked,
    #[error("{0}")]
    Internal(String),
}

impl From<MsdError> for ApiError {
    fn from(err: MsdError) -> Self {
        match err {
            MsdError::Busy => ApiError::Busy(err.to_string()),
            MsdError::Internal(msg) => ApiError::Internal(msg),
            other => ApiError::Operation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MsdConfig {
    pub storage_root: PathBuf,
    pub gadget_path: PathBuf,
    pub remount_cmd: Vec<String>,
    pub read_chunk_size: usize,
    pub write_chunk_size: usize,
    pub sync_chunk_size: u64,
    pub initial_image: Option<String>,
    pub initial_cdrom: bool,
}

impl Default for MsdConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/kvmd/msd"),
            gadget_path: PathBuf::from("/sys/kernel/config/usb_gadget/kvmd"),
            remount_cmd: Vec::new(),
            read_chunk_size: 65536,
            write_chunk_size: 65536,
            sync_chunk_size: 4 * 1024 * 1024,
            initial_image: None,
            initial_cdrom: false,
        }
    }
}

/// Operator-facing virtual drive state; independent from the LUN until
/// `set_connected` pushes it there.
#[derive(Debug, Clone, PartialEq, Default)]
struct VirtualDrive {
    image: Option<ImageInfo>,
    connected: bool,
    cdrom: bool,
    rw: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveImagePub {
    pub name: String,
    #[serde(flatten)]
    pub info: ImageInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrivePub {
    pub image: Option<DriveImagePub>,
    pub connected: bool,
    pub cdrom: bool,
    pub rw: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoragePub {
    pub size: u64,
    pub free: u64,
    pub images: BTreeMap<String, ImageInfo>,
    pub parts: BTreeMap<String, PartInfo>,
    pub downloading: Option<TransferState>,
    pub uploading: Option<TransferState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MsdState {
    pub enabled: bool,
    pub online: bool,
    pub busy: bool,
    pub storage: Option<StoragePub>,
    pub drive: Option<DrivePub>,
}

struct Inner {
    storage: Storage,
    online: bool,
    vd: Option<VirtualDrive>,
    reset_requested: bool,
}

#[derive(Default)]
struct Transfers {
    downloading: Option<TransferState>,
    uploading: Option<TransferState>,
}

pub struct Msd {
    config: MsdConfig,
    drive: Drive,
    inner: Mutex<Inner>,
    transfers: SyncMutex<Transfers>,
    region: ExclusiveRegion,
    notifier: Arc<Notifier>,
}

impl Msd {
    pub fn new(config: MsdConfig, notifier: Arc<Notifier>) -> Self {
        let drive = Drive::new(&config.gadget_path, 0, 0);
        let storage = Storage::new(
            config.storage_root.clone(),
            Remounter::new(config.remount_cmd.clone()),
        );
        Self {
            config,
            drive,
            inner: Mutex::new(Inner {
                storage,
                online: false,
                vd: None,
                reset_requested: false,
            }),
            transfers: SyncMutex::new(Transfers::default()),
            region: ExclusiveRegion::new(),
            notifier,
        }
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    pub async fn get_state(&self) -> MsdState {
        let inner = self.inner.lock().await;
        self.compose_state(&inner)
    }

    pub fn trigger_state(&self) {
        self.notifier.notify(NOTIFY_FULL);
    }

    pub fn poll_state(self: &Arc<Self>) -> impl Stream<Item = MsdState> + Send {
        let this = self.clone();
        async_stream::stream! {
            let mut prev: Option<MsdState> = None;
            loop {
                let state = this.get_state().await;
                if prev.as_ref() != Some(&state) {
                    prev = Some(state.clone());
                    yield state;
                }
                if this.notifier.wait().await > 0 {
                    prev = None;
                }
            }
        }
    }

    fn compose_state(&self, inner: &Inner) -> MsdState {
        let transfers = self.transfers.lock();
        let storage = inner.online.then(|| {
            let state = inner.storage.state();
            StoragePub {
                size: state.size,
                free: state.free,
                images: state.images.clone(),
                parts: state.parts.clone(),
                downloading: transfers.downloading.clone(),
                uploading: transfers.uploading.clone(),
            }
        });
        let drive = inner.vd.as_ref().map(|vd| DrivePub {
            image: vd.image.as_ref().map(|image| DriveImagePub {
                name: image.name.clone(),
                info: image.clone(),
            }),
            connected: vd.connected,
            cdrom: vd.cdrom,
            rw: vd.rw,
        });
        MsdState {
            enabled: true,
            online: inner.online && drive.is_some() && self.drive.is_enabled(),
            busy: self.region.is_busy(),
            storage,
            drive,
        }
    }

    fn busy_guard(&self) -> Result<RegionGuard, MsdError> {
        self.region.try_enter().ok_or(MsdError::Busy)
    }

    fn check_online(inner: &Inner) -> Result<&VirtualDrive, MsdError> {
        if !inner.online {
            return Err(MsdError::Offline);
        }
        inner.vd.as_ref().ok_or(MsdError::Offline)
    }

    fn check_disconnected(&self, inner: &Inner) -> Result<(), MsdError> {
        let vd = Self::check_online(inner)?;
        let lun_busy = matches!(self.drive.get_image_path(), Ok(Some(_)));
        if vd.connected || lun_busy {
            return Err(MsdError::Connected);
        }
        Ok(())
    }

    fn check_connected(&self, inner: &Inner) -> Result<(), MsdError> {
        let vd = Self::check_online(inner)?;
        let lun_busy = matches!(self.drive.get_image_path(), Ok(Some(_)));
        if !(vd.connected || lun_busy) {
            return Err(MsdError::Disconnected);
        }
        Ok(())
    }

    // ===== Operator verbs.

    pub async fn set_params(
        &self,
        name: Option<&str>,
        cdrom: Option<bool>,
        rw: Option<bool>,
    ) -> Result<(), MsdError> {
        let _guard = self.busy_guard()?;
        let mut inner = self.inner.lock().await;
        self.check_disconnected(&inner)?;

        let new_image = match name {
            Some("") => Some(None),
            Some(name) => Some(Some(
                inner
                    .storage
                    .image(name)
                    .cloned()
                    .filter(|image| image.path.exists())
                    .ok_or(MsdError::UnknownImage)?,
            )),
            None => None,
        };

        let vd = inner.vd.as_mut().expect("checked online");
        if let Some(image) = new_image {
            vd.image = image;
        }
        if let Some(cdrom) = cdrom {
            vd.cdrom = cdrom;
            if cdrom {
                vd.rw = false;
            }
        }
        if let Some(rw) = rw {
            vd.rw = rw;
            if rw {
                vd.cdrom = false;
            }
        }
        drop(inner);
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(())
    }

    pub async fn set_connected(&self, connected: bool) -> Result<(), MsdError> {
        let _guard = self.busy_guard()?;
        let mut inner = self.inner.lock().await;
        if connected {
            self.check_disconnected(&inner)?;
            let vd = inner.vd.as_ref().expect("checked online");
            let image = vd.image.clone().ok_or(MsdError::ImageNotSelected)?;
            if !image.path.exists() {
                return Err(MsdError::UnknownImage);
            }
            debug_assert!(image.in_storage);

            self.drive.set_rw_flag(vd.rw)?;
            self.drive.set_cdrom_flag(vd.cdrom)?;
            self.rebind_udc();
            if vd.rw && !inner.storage.is_adopted(&image.path) {
                inner.storage.remount_rw(true).await?;
            }
            self.drive.set_image_path(Some(&image.path))?;
        } else {
            self.check_connected(&inner)?;
            self.drive.set_image_path(None)?;
            inner.storage.remount_rw_unchecked(false).await;
        }
        if let Some(vd) = inner.vd.as_mut() {
            vd.connected = connected;
        }
        drop(inner);
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(())
    }

    /// In-place UDC unbind/rebind. Works around a mode-switch quirk where
    /// the host keeps the stale medium type after flipping cdrom/flash.
    fn rebind_udc(&self) {
        let udc_path = self.drive.udc_path();
        let result = (|| -> std::io::Result<()> {
            let enabled = !std::fs::read_to_string(udc_path)?.trim().is_empty();
            if enabled {
                std::fs::write(udc_path, "\n")?;
            }
            let mut names: Vec<String> = std::fs::read_dir("/sys/class/udc")?
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            if let Some(name) = names.first() {
                std::fs::write(udc_path, name)?;
            }
            Ok(())
        })();
        if let Err(err) = result {
            error!(%err, "can't rebind UDC");
        }
    }

    pub async fn remove(&self, name: &str) -> Result<(), MsdError> {
        let _guard = self.busy_guard()?;
        let mut inner = self.inner.lock().await;
        self.check_disconnected(&inner)?;
        let image = inner
            .storage
            .image(name)
            .cloned()
            .filter(|image| image.path.exists())
            .ok_or(MsdError::UnknownImage)?;

        if let Some(vd) = inner.vd.as_mut() {
            if vd.image.as_ref().map(|i| &i.path) == Some(&image.path) {
                vd.image = None;
            }
        }

        let adopted = inner.storage.is_adopted(&image.path);
        if !adopted {
            inner.storage.remount_rw(true).await?;
        }
        let removal = async {
            tokio::fs::remove_file(&image.path)
                .await
                .map_err(|err| MsdError::Internal(format!("can't remove image: {err}")))?;
            set_complete(&image.path, true).await
        }
        .await;
        if !adopted {
            inner.storage.remount_rw_unchecked(false).await;
        }
        drop(inner);
        self.notifier.notify(NOTIFY_CHANGED);
        removal
    }

    pub async fn reset(&self) -> Result<(), MsdError> {
        let _guard = self.busy_guard()?;
        let mut inner = self.inner.lock().await;
        inner.reset_requested = true;
        let result = (|| -> Result<(), MsdError> {
            self.drive.set_image_path(None)?;
            self.drive.set_cdrom_flag(false)?;
            self.drive.set_rw_flag(false)?;
            Ok(())
        })();
        if let Err(err) = &result {
            error!(%err, "can't reset MSD properly");
        }
        inner.storage.remount_rw_unchecked(false).await;
        drop(inner);
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(())
    }

    pub async fn cleanup(&self) {
        // Readers/writers clean themselves up on drop.
    }

    // ===== Streaming transfers.

    pub async fn read_image(self: &Arc<Self>, name: &str) -> Result<MsdReadHandle, MsdError> {
        let guard = self.busy_guard()?;
        let inner = self.inner.lock().await;
        self.check_disconnected(&inner)?;
        let image = inner
            .storage
            .image(name)
            .cloned()
            .filter(|image| image.path.exists())
            .ok_or(MsdError::UnknownImage)?;
        drop(inner);

        let reader = io::ImageReader::open(
            self.notifier.clone(),
            &image.name,
            &image.path,
            self.config.read_chunk_size,
        )
        .await?;
        self.transfers.lock().downloading = Some(reader.state());
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(MsdReadHandle {
            msd: self.clone(),
            reader,
            _guard: guard,
        })
    }

    pub async fn write_image(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        remove_incomplete: bool,
    ) -> Result<MsdWriteHandle, MsdError> {
        let guard = self.busy_guard()?;
        let inner = self.inner.lock().await;
        self.check_disconnected(&inner)?;
        if inner.storage.image(name).is_some() {
            return Err(MsdError::ImageExists);
        }
        let image = inner
            .storage
            .make_image_by_name(name)
            .ok_or(MsdError::UnknownImage)?;
        if image.path.exists() {
            return Err(MsdError::ImageExists);
        }
        inner.storage.remount_rw(true).await?;
        drop(inner);

        set_complete(&image.path, false).await?;
        let writer = io::ImageWriter::open(
            self.notifier.clone(),
            &image.name,
            &image.path,
            size,
            self.config.sync_chunk_size,
            self.config.write_chunk_size,
        )
        .await?;
        self.transfers.lock().uploading = Some(writer.state());
        self.notifier.notify(NOTIFY_CHANGED);
        Ok(MsdWriteHandle {
            msd: self.clone(),
            writer: Some(writer),
            remove_incomplete,
            guard: Some(guard),
        })
    }

    async fn finish_write(&self, path: &std::path::Path, complete: bool, remove_incomplete: bool) {
        if let Err(err) = set_complete(path, complete).await {
            error!(%err, "can't update image completeness");
        }
        if !complete && remove_incomplete {
            warn!(path = %path.display(), "removing incomplete image");
            let _ = tokio::fs::remove_file(path).await;
            let _ = set_complete(path, true).await;
        }
        let inner = self.inner.lock().await;
        inner.storage.remount_rw_unchecked(false).await;
        drop(inner);
        self.transfers.lock().uploading = None;
        self.notifier.notify(NOTIFY_CHANGED);
    }

    // ===== Reconciliation loop.

    /// Watches the storage tree and the gadget attributes, reloading state
    /// on any change. Run as a supervised task.
    pub async fn systask(self: Arc<Self>) {
        loop {
            if let Err(err) = self.watch_cycle().await {
                error!(%err, "MSD watcher error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// One-shot state reload; the watcher calls this on every change.
    pub async fn refresh(&self) {
        self.reload_state().await;
    }

    async fn watch_cycle(&self) -> Result<(), MsdError> {
        // Wait until the storage and the gadget are both present.
        loop {
            self.reload_state().await;
            if self.inner.lock().await.vd.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        let mut watcher = kvmd_core::inotify::Watcher::new()
            .map_err(|err| MsdError::Internal(format!("can't init inotify: {err}")))?;
        {
            let inner = self.inner.lock().await;
            let watch = |watcher: &mut kvmd_core::inotify::Watcher, path: &std::path::Path| {
                watcher
                    .watch(path)
                    .map_err(|err| MsdError::Internal(format!("can't watch {}: {err}", path.display())))
            };
            for path in inner.storage.watchable_paths() {
                watch(&mut watcher, &path)?;
            }
            for path in self.drive.watchable_paths() {
                if path.exists() {
                    watch(&mut watcher, &path)?;
                }
            }
        }
        // Re-check after arming the watches so nothing slips between.
        self.reload_state().await;

        loop {
            if self.inner.lock().await.vd.is_none() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;

            let drained = watcher.drain();
            let reset = {
                let mut inner = self.inner.lock().await;
                std::mem::take(&mut inner.reset_requested)
            };
            if drained.restart || reset {
                info!("reinitializing MSD watcher");
                return Ok(());
            }
            if drained.changed {
                self.reload_state().await;
            } else if self.transfers.lock().uploading.is_some() {
                // Keep free-space numbers fresh during a long upload.
                let mut inner = self.inner.lock().await;
                inner.storage.reload_parts();
                drop(inner);
                self.notifier.notify(NOTIFY_CHANGED);
            }
        }
    }

    async fn reload_state(&self) {
        let mut inner = self.inner.lock().await;
        let result = (|| -> Result<(PathBuf, bool, bool), MsdError> {
            let path = self.drive.get_image_path()?;
            let cdrom = self.drive.get_cdrom_flag()?;
            let rw = self.drive.get_rw_flag()?;
            Ok((path.unwrap_or_default(), cdrom, rw))
        })();

        let reload = tokio::task::block_in_place(|| inner.storage.reload());

        match (result, reload) {
            (Ok((lun_path, cdrom, rw)), Ok(())) => {
                let first_load = inner.vd.is_none();
                let lun_image = if lun_path.as_os_str().is_empty() {
                    None
                } else {
                    inner.storage.make_image_by_path(&lun_path)
                };

                if let Some(image) = lun_image {
                    // A really attached image overrides the virtual state.
                    inner.vd = Some(VirtualDrive {
                        image: Some(image),
                        connected: true,
                        cdrom,
                        rw,
                    });
                } else {
                    let vd = inner.vd.get_or_insert_with(|| VirtualDrive {
                        image: None,
                        connected: false,
                        cdrom,
                        rw,
                    });
                    if let Some(image) = &vd.image {
                        if !image.in_storage || !image.path.exists() {
                            vd.image = None;
                        }
                    }
                    vd.connected = false;
                }
                inner.online = true;

                if first_load {
                    self.setup_initial(&mut inner).await;
                }
            }
            (result, reload) => {
                if let Err(err) = result {
                    error!(%err, "can't read MSD drive state, switching to offline");
                }
                if let Err(err) = reload {
                    error!(%err, "can't reload MSD storage, switching to offline");
                }
                inner.online = false;
                inner.vd = None;
            }
        }
        drop(inner);
        self.notifier.notify(NOTIFY_CHANGED);
    }

    /// Applies the configured initial image after the first successful
    /// mount: selected and flagged, but left disconnected for the
    /// operator.
    async fn setup_initial(&self, inner: &mut Inner) {
        let Some(name) = &self.config.initial_image else {
            return;
        };
        match inner.storage.make_image_by_name(name) {
            Some(image) if image.path.exists() => {
                info!(name, "setting up initial MSD image");
                if let Some(vd) = inner.vd.as_mut() {
                    vd.image = Some(image);
                    vd.cdrom = self.config.initial_cdrom;
                    vd.rw = false;
                }
            }
            _ => {
                error!(name, "can't find initial MSD image, ignored");
            }
        }
    }
}

/// Open read stream; dropping it releases the busy region and the
/// progress slot.
pub struct MsdReadHandle {
    msd: Arc<Msd>,
    reader: io::ImageReader,
    _guard: RegionGuard,
}

impl MsdReadHandle {
    pub fn total_size(&self) -> u64 {
        self.reader.total_size()
    }

    pub fn chunk_size(&self) -> usize {
        self.reader.chunk_size()
    }

    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, MsdError> {
        let chunk = self.reader.read_chunk().await?;
        self.msd.transfers.lock().downloading = Some(self.reader.state());
        Ok(chunk)
    }
}

impl Drop for MsdReadHandle {
    fn drop(&mut self) {
        self.msd.transfers.lock().downloading = None;
        self.msd.notifier.notify(NOTIFY_CHANGED);
    }
}

/// Open write stream. `commit()` finalizes; dropping without commit runs
/// the abort path (incomplete marker kept or image removed, storage back
/// to RO).
pub struct MsdWriteHandle {
    msd: Arc<Msd>,
    writer: Option<io::ImageWriter>,
    remove_incomplete: bool,
    guard: Option<RegionGuard>,
}

impl MsdWriteHandle {
    pub fn chunk_size(&self) -> usize {
        self.writer.as_ref().expect("writer open").chunk_size()
    }

    pub fn written(&self) -> u64 {
        self.writer.as_ref().map(|w| w.written()).unwrap_or(0)
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<u64, MsdError> {
        let writer = self.writer.as_mut().expect("writer open");
        let written = writer.write_chunk(chunk).await?;
        self.msd.transfers.lock().uploading = Some(writer.state());
        Ok(written)
    }

    /// Finishes the upload and runs the completion protocol.
    pub async fn commit(mut self) -> Result<u64, MsdError> {
        let writer = self.writer.take().expect("writer open");
        let written = writer.written();
        let path = writer.path().to_owned();
        let complete = writer.finish().await;
        self.msd
            .finish_write(&path, complete, self.remove_incomplete)
            .await;
        Ok(written)
    }
}

impl Drop for MsdWriteHandle {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            // Client went away mid-upload; finish the protocol out of
            // band, keeping the busy region held until it is done.
            let msd = self.msd.clone();
            let remove_incomplete = self.remove_incomplete;
            let guard = self.guard.take();
            let path = writer.path().to_owned();
            tokio::spawn(async move {
                let complete = writer.finish().await;
                msd.finish_write(&path, complete, remove_incomplete).await;
                drop(guard);
            });
        }
    }
}
