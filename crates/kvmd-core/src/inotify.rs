//! Non-blocking inotify wrapper shared by the reconciliation loops. The
//! consumers drain once per tick instead of parking on the fd, which also
//! bounds reaction latency to their tick period.

use std::io;
use std::path::Path;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drained {
    pub changed: bool,
    /// Unmount/self-delete/overflow: the watch set itself is invalid and
    /// the owning loop must reinitialize.
    pub restart: bool,
}

pub struct Watcher {
    inotify: Inotify,
}

const WATCH_FLAGS: AddWatchFlags = AddWatchFlags::IN_ATTRIB
    .union(AddWatchFlags::IN_CLOSE_WRITE)
    .union(AddWatchFlags::IN_CREATE)
    .union(AddWatchFlags::IN_DELETE)
    .union(AddWatchFlags::IN_DELETE_SELF)
    .union(AddWatchFlags::IN_MODIFY)
    .union(AddWatchFlags::IN_MOVE_SELF)
    .union(AddWatchFlags::IN_MOVED_FROM)
    .union(AddWatchFlags::IN_MOVED_TO);

impl Watcher {
    pub fn new() -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        Ok(Self { inotify })
    }

    pub fn watch(&mut self, path: &Path) -> io::Result<()> {
        self.inotify.add_watch(path, WATCH_FLAGS)?;
        Ok(())
    }

    /// Drains all pending events without blocking.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        loop {
            match self.inotify.read_events() {
                Ok(events) => {
                    for event in events {
                        drained.changed = true;
                        let restart_mask = AddWatchFlags::IN_UNMOUNT
                            | AddWatchFlags::IN_DELETE_SELF
                            | AddWatchFlags::IN_MOVE_SELF
                            | AddWatchFlags::IN_Q_OVERFLOW;
                        if event.mask.intersects(restart_mask) {
                            drained.restart = true;
                        }
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => {
                    drained.restart = true;
                    break;
                }
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_changes_in_watched_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        assert_eq!(watcher.drain(), Drained::default());

        std::fs::write(dir.path().join("image.iso"), b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let drained = watcher.drain();
        assert!(drained.changed);
        assert!(!drained.restart);
    }

    #[test]
    fn deleting_watched_dir_requests_restart() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("watched");
        std::fs::create_dir(&dir).unwrap();
        let mut watcher = Watcher::new().unwrap();
        watcher.watch(&dir).unwrap();

        std::fs::remove_dir(&dir).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let drained = watcher.drain();
        assert!(drained.changed);
        assert!(drained.restart);
    }
}
