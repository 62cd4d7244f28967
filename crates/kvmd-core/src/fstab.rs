//! Locating specially-tagged mount points in /etc/fstab. The MSD storage
//! and the persistent-state partition are marked with
//! `X-kvmd.<type>-root=...` options so the daemon never guesses paths.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub mount_path: PathBuf,
    pub root_path: PathBuf,
    pub user: String,
    pub group: String,
}

pub fn find_msd(fstab_path: &Path) -> Option<Partition> {
    find_tagged(fstab_path, "otgmsd")
}

pub fn find_pst(fstab_path: &Path) -> Option<Partition> {
    find_tagged(fstab_path, "pst")
}

fn find_tagged(fstab_path: &Path, part_type: &str) -> Option<Partition> {
    let content = std::fs::read_to_string(fstab_path).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            continue;
        }
        let mut root = None;
        let mut user = String::new();
        let mut group = String::new();
        let mut tagged = false;
        for option in fields[3].split(',') {
            let prefix = format!("X-kvmd.{part_type}-");
            if let Some(rest) = option.strip_prefix(&prefix) {
                tagged = true;
                let (key, value) = match rest.split_once('=') {
                    Some((key, value)) => (key, value),
                    None => (rest, ""),
                };
                match key {
                    "root" if !value.is_empty() => root = Some(PathBuf::from(value)),
                    "user" => user = value.to_owned(),
                    "group" => group = value.to_owned(),
                    _ => {}
                }
            }
        }
        if tagged {
            let mount_path = PathBuf::from(fields[1]);
            return Some(Partition {
                root_path: root.unwrap_or_else(|| mount_path.clone()),
                mount_path,
                user,
                group,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fstab(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn finds_tagged_partition_with_root_override() {
        let (_dir, path) = write_fstab(
            "# comment\n\
             /dev/mmcblk0p1 /boot vfat defaults 0 2\n\
             /dev/mmcblk0p3 /var/lib/kvmd/msd ext4 ro,X-kvmd.otgmsd-root=/var/lib/kvmd/msd,X-kvmd.otgmsd-user=kvmd 0 2\n",
        );
        let part = find_msd(&path).unwrap();
        assert_eq!(part.mount_path, PathBuf::from("/var/lib/kvmd/msd"));
        assert_eq!(part.root_path, PathBuf::from("/var/lib/kvmd/msd"));
        assert_eq!(part.user, "kvmd");
    }

    #[test]
    fn mount_path_is_default_root() {
        let (_dir, path) = write_fstab(
            "/dev/sda1 /mnt/pst ext4 rw,X-kvmd.pst-root 0 2\n",
        );
        let part = find_pst(&path).unwrap();
        assert_eq!(part.root_path, PathBuf::from("/mnt/pst"));
    }

    #[test]
    fn missing_tag_yields_none() {
        let (_dir, path) = write_fstab("/dev/sda1 / ext4 rw 0 1\n");
        assert!(find_msd(&path).is_none());
    }
}
