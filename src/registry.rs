//! Persistent free-IP reuse-cooldown registry. Survives plugin invocations;
//! `track` starts a cooldown clock, `track_at_epoch` seeds an entry as
//! immediately eligible without disturbing one that already exists.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

const SCHEMA_VERSION: u32 = 1;
const FILE_NAME: &str = "registry.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Entry {
    released_on: Timestamp,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Contents {
    schema_version: u32,
    ips: HashMap<String, Entry>,
}

impl Default for Contents {
    fn default() -> Self {
        Contents {
            schema_version: SCHEMA_VERSION,
            ips: HashMap::new(),
        }
    }
}

pub struct Registry {
    dir: PathBuf,
    inner: Mutex<()>,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Registry {
            dir: dir.into(),
            inner: Mutex::new(()),
        }
    }

    fn path(&self) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(self.dir.join(FILE_NAME))
    }

    /// Loads the registry, seeding it from `seed` (the currently
    /// free-but-unregistered IPs) at the zero epoch if the file does not
    /// exist yet, and wiping to empty on any corruption or schema mismatch.
    fn load(&self, seed: impl FnOnce() -> Vec<Ipv4Addr>) -> Contents {
        let path = match self.path() {
            Ok(p) => p,
            Err(_) => return Contents::default(),
        };
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut contents = Contents::default();
                for ip in seed() {
                    contents.ips.insert(ip.to_string(), Entry { released_on: Timestamp::epoch() });
                }
                self.save(&contents);
                return contents;
            }
            Err(_) => return Contents::default(),
        };
        match serde_json::from_slice::<Contents>(&raw) {
            Ok(contents) if contents.schema_version == SCHEMA_VERSION => contents,
            _ => Contents::default(),
        }
    }

    fn save(&self, contents: &Contents) {
        let Ok(path) = self.path() else { return };
        let _ = write_atomic(&path, contents);
    }

    pub fn track(&self, ip: Ipv4Addr) {
        let _g = self.inner.lock().unwrap();
        let mut contents = self.load(Vec::new);
        contents.ips.insert(
            ip.to_string(),
            Entry {
                released_on: Timestamp::now(),
            },
        );
        self.save(&contents);
    }

    /// Seed-only insert: does nothing if the IP is already tracked.
    pub fn track_at_epoch(&self, ip: Ipv4Addr) {
        let _g = self.inner.lock().unwrap();
        let mut contents = self.load(Vec::new);
        contents
            .ips
            .entry(ip.to_string())
            .or_insert(Entry { released_on: Timestamp::epoch() });
        self.save(&contents);
    }

    pub fn forget(&self, ip: Ipv4Addr) {
        let _g = self.inner.lock().unwrap();
        let mut contents = self.load(Vec::new);
        contents.ips.remove(&ip.to_string());
        self.save(&contents);
    }

    pub fn has(&self, ip: Ipv4Addr) -> bool {
        let _g = self.inner.lock().unwrap();
        let contents = self.load(Vec::new);
        contents.ips.contains_key(&ip.to_string())
    }

    pub fn tracked_before(&self, t: SystemTime) -> Vec<Ipv4Addr> {
        let _g = self.inner.lock().unwrap();
        let contents = self.load(Vec::new);
        let cutoff = Timestamp(t);
        contents
            .ips
            .iter()
            .filter(|(_, entry)| entry.released_on < cutoff)
            .filter_map(|(ip, _)| ip.parse().ok())
            .collect()
    }

    pub fn list(&self) -> Vec<Ipv4Addr> {
        let _g = self.inner.lock().unwrap();
        self.load(Vec::new).ips.keys().filter_map(|s| s.parse().ok()).collect()
    }

    pub fn clear(&self) {
        let _g = self.inner.lock().unwrap();
        if let Ok(path) = self.path() {
            let _ = fs::remove_file(path);
        }
    }

    /// Seeds the registry on first creation from the current free-IP scan.
    /// Call once at startup before any other registry operation when the
    /// caller wants the empty-file-seeding behaviour to use a real scan
    /// rather than an empty seed.
    pub fn load_with_seed(&self, seed: impl FnOnce() -> Vec<Ipv4Addr>) {
        let _g = self.inner.lock().unwrap();
        let _ = self.load(seed);
    }
}

fn write_atomic(path: &Path, contents: &Contents) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> Registry {
        let dir = tempfile::tempdir().unwrap();
        Registry::new(dir.into_path())
    }

    #[test]
    fn round_trip_track_and_forget() {
        let reg = scratch();
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        reg.track(ip);
        assert!(reg.has(ip));
        reg.forget(ip);
        assert!(!reg.has(ip));
    }

    #[test]
    fn cooldown_respected() {
        let reg = scratch();
        let ip: Ipv4Addr = "10.0.0.6".parse().unwrap();
        reg.track(ip);
        let before = reg.tracked_before(SystemTime::now() - Duration::from_secs(60));
        assert!(!before.contains(&ip));
        let after = reg.tracked_before(SystemTime::now() + Duration::from_secs(60));
        assert!(after.contains(&ip));
    }

    #[test]
    fn track_at_epoch_does_not_overwrite() {
        let reg = scratch();
        let ip: Ipv4Addr = "10.0.0.7".parse().unwrap();
        reg.track(ip);
        let before = reg.tracked_before(SystemTime::now() + Duration::from_secs(3600));
        assert!(before.contains(&ip));
        reg.track_at_epoch(ip);
        // still tracked at the original (recent) time, not reset to epoch
        let still_recent = reg.tracked_before(SystemTime::now() - Duration::from_secs(5));
        assert!(!still_recent.contains(&ip));
    }

    #[test]
    fn corrupt_file_resets_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(FILE_NAME), b"not json").unwrap();
        assert!(reg.list().is_empty());
    }
}
