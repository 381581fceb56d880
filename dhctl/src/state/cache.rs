use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

pub const MASTER_HOSTS_KEY: &str = "cluster-hosts";
const NODE_STATE_SUFFIX: &str = ".tfstate";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Io error on '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Malformed cache entry '{}': {}", .0, .1)]
    Malformed(String, serde_json::Error),
    #[error("Invalid cache key '{}'!", .0)]
    InvalidKey(String),
}

/// Local key/value store shared by the converge phases.
pub trait StateCache: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
}

pub fn node_state_key(node_name: &str) -> String {
    format!("{node_name}{NODE_STATE_SUFFIX}")
}

pub struct DirectoryCache {
    path: PathBuf,
}

impl DirectoryCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        debug!("Used state cache directory: {path:?}");
        fs::create_dir_all(path).map_err(|error| CacheError::Io(path.to_owned(), error))?;

        Ok(Self {
            path: path.to_owned(),
        })
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(CacheError::InvalidKey(key.to_owned()));
        }

        Ok(self.path.join(key))
    }
}

impl StateCache for DirectoryCache {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;
        let staging = self.path.join(format!(".{key}.tmp"));

        fs::write(&staging, value).map_err(|error| CacheError::Io(staging.clone(), error))?;
        fs::rename(&staging, &path).map_err(|error| CacheError::Io(path, error))
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key)?;

        match fs::read(&path) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(CacheError::Io(path, error)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;

        match fs::remove_file(&path) {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(CacheError::Io(path, error)),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateCache for MemoryCache {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

pub fn load_master_hosts(cache: &dyn StateCache) -> Result<BTreeMap<String, String>, CacheError> {
    match cache.load(MASTER_HOSTS_KEY)? {
        Some(raw) => serde_json::from_slice(&raw)
            .map_err(|error| CacheError::Malformed(MASTER_HOSTS_KEY.to_owned(), error)),
        None => Ok(BTreeMap::new()),
    }
}

fn save_master_hosts(
    cache: &dyn StateCache,
    hosts: &BTreeMap<String, String>,
) -> Result<(), CacheError> {
    let raw = serde_json::to_vec(hosts)
        .map_err(|error| CacheError::Malformed(MASTER_HOSTS_KEY.to_owned(), error))?;

    cache.save(MASTER_HOSTS_KEY, &raw)
}

/// Union-merges `hosts` into the cached master map.
pub fn merge_master_hosts(
    cache: &dyn StateCache,
    hosts: &BTreeMap<String, String>,
) -> Result<(), CacheError> {
    let mut cached = load_master_hosts(cache)?;
    cached.extend(hosts.iter().map(|(name, host)| (name.clone(), host.clone())));

    save_master_hosts(cache, &cached)
}

pub fn remove_master_hosts(cache: &dyn StateCache, names: &[String]) -> Result<(), CacheError> {
    let mut cached = load_master_hosts(cache)?;
    let before = cached.len();
    cached.retain(|name, _| !names.contains(name));

    if cached.len() == before {
        return Ok(());
    }

    save_master_hosts(cache, &cached)
}

/// Drops every cached master that is not part of the current infra state.
pub fn retain_master_hosts<'a>(
    cache: &dyn StateCache,
    names: impl IntoIterator<Item = &'a String>,
) -> Result<(), CacheError> {
    let keep: Vec<&String> = names.into_iter().collect();
    let cached = load_master_hosts(cache)?;
    let stale: Vec<String> = cached
        .keys()
        .filter(|name| !keep.contains(name))
        .cloned()
        .collect();

    remove_master_hosts(cache, &stale)
}
