//! Filesystem JSON TTL cache. One file per key, atomic write via a temp
//! file renamed into place, `{_expires, contents}` envelope.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Serialize};

use crate::timestamp::Timestamp;

#[derive(Debug, PartialEq, Eq)]
pub enum GetState {
    Found,
    Expired,
    Missing,
    Unavailable,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreState {
    Stored,
    Unavailable,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope<T> {
    #[serde(rename = "_expires")]
    expires: Timestamp,
    contents: T,
}

pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Cache { dir: dir.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(sanitize(key))
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(&self.dir, perms)?;
        }
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> (GetState, Option<T>) {
        let path = self.key_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (GetState::Missing, None),
            Err(_) => return (GetState::Unavailable, None),
        };
        let envelope: Envelope<T> = match serde_json::from_slice(&raw) {
            Ok(env) => env,
            Err(_) => return (GetState::Missing, None),
        };
        if envelope.expires.0 <= SystemTime::now() {
            return (GetState::Expired, None);
        }
        (GetState::Found, Some(envelope.contents))
    }

    pub fn store<T: Serialize>(&self, key: &str, ttl: Duration, value: &T) -> StoreState {
        if self.ensure_dir().is_err() {
            return StoreState::Unavailable;
        }
        let envelope = Envelope {
            expires: Timestamp(SystemTime::now() + ttl),
            contents: value,
        };
        let path = self.key_path(key);
        match write_atomic(&path, &envelope) {
            Ok(()) => StoreState::Stored,
            Err(_) => StoreState::Unavailable,
        }
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
