//! The mass-storage LUN of an already-provisioned USB gadget. This only
//! writes attributes the sibling helper created; it never touches the
//! configfs tree structure itself.

use std::path::{Path, PathBuf};

use crate::MsdError;

pub struct Drive {
    profile_path: PathBuf,
    profile_func_path: PathBuf,
    lun_path: PathBuf,
    udc_path: PathBuf,
}

impl Drive {
    /// `gadget_path` is `/sys/kernel/config/usb_gadget/<name>`.
    pub fn new(gadget_path: &Path, instance: u32, lun: u32) -> Self {
        let func = format!("mass_storage.usb{instance}");
        Self {
            profile_path: gadget_path.join("configs/c.1"),
            profile_func_path: gadget_path.join("configs/c.1").join(&func),
            lun_path: gadget_path.join("functions").join(&func).join(format!("lun.{lun}")),
            udc_path: gadget_path.join("UDC"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.profile_func_path.exists()
    }

    pub fn watchable_paths(&self) -> Vec<PathBuf> {
        vec![self.lun_path.clone(), self.profile_path.clone()]
    }

    pub fn udc_path(&self) -> &Path {
        &self.udc_path
    }

    pub fn set_image_path(&self, path: Option<&Path>) -> Result<(), MsdError> {
        match path {
            Some(path) => self.set_param("file", &path.to_string_lossy()),
            None => self.set_param("forced_eject", ""),
        }
    }

    pub fn get_image_path(&self) -> Result<Option<PathBuf>, MsdError> {
        let raw = self.get_param("file")?;
        if raw.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from(raw)))
        }
    }

    pub fn set_cdrom_flag(&self, flag: bool) -> Result<(), MsdError> {
        self.set_param("cdrom", if flag { "1" } else { "0" })
    }

    pub fn get_cdrom_flag(&self) -> Result<bool, MsdError> {
        Ok(self.get_param("cdrom")? == "1")
    }

    pub fn set_rw_flag(&self, rw: bool) -> Result<(), MsdError> {
        self.set_param("ro", if rw { "0" } else { "1" })
    }

    pub fn get_rw_flag(&self) -> Result<bool, MsdError> {
        Ok(self.get_param("ro")? == "0")
    }

    fn get_param(&self, param: &str) -> Result<String, MsdError> {
        std::fs::read_to_string(self.lun_path.join(param))
            .map(|raw| raw.trim().to_owned())
            .map_err(|err| MsdError::Internal(format!("can't read LUN {param}: {err}")))
    }

    fn set_param(&self, param: &str, value: &str) -> Result<(), MsdError> {
        match std::fs::write(self.lun_path.join(param), format!("{value}\n")) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) => {
                Err(MsdError::DriveLocked)
            }
            Err(err) => Err(MsdError::Internal(format!("can't write LUN {param}: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_gadget() -> (tempfile::TempDir, Drive) {
        let dir = tempfile::tempdir().unwrap();
        let gadget = dir.path().join("g1");
        let lun = gadget.join("functions/mass_storage.usb0/lun.0");
        std::fs::create_dir_all(&lun).unwrap();
        std::fs::create_dir_all(gadget.join("configs/c.1/mass_storage.usb0")).unwrap();
        std::fs::write(lun.join("file"), "\n").unwrap();
        std::fs::write(lun.join("cdrom"), "0\n").unwrap();
        std::fs::write(lun.join("ro"), "0\n").unwrap();
        std::fs::write(gadget.join("UDC"), "fe980000.usb\n").unwrap();
        let drive = Drive::new(&gadget, 0, 0);
        (dir, drive)
    }

    #[test]
    fn attribute_round_trip() {
        let (_dir, drive) = fake_gadget();
        assert!(drive.is_enabled());
        assert_eq!(drive.get_image_path().unwrap(), None);

        drive.set_image_path(Some(Path::new("/images/test.iso"))).unwrap();
        assert_eq!(
            drive.get_image_path().unwrap(),
            Some(PathBuf::from("/images/test.iso"))
        );

        drive.set_cdrom_flag(true).unwrap();
        assert!(drive.get_cdrom_flag().unwrap());

        drive.set_rw_flag(false).unwrap();
        assert!(!drive.get_rw_flag().unwrap());
        drive.set_rw_flag(true).unwrap();
        assert!(drive.get_rw_flag().unwrap());
    }
}
