use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};

const RETRIES: usize = 3;

/// Storage capability the core sees. Remote schemes (s3, http, ...) sit
/// behind this same trait, supplied by the embedding application.
pub trait Endpoint: Send + Sync {
    /// Read a whole file.
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Binary-safe read. Identical semantics for the built-in backends.
    fn get_binary(&self, path: &str) -> Result<Vec<u8>> {
        self.get(path)
    }

    /// Existence check plus length.
    fn try_get_size(&self, path: &str) -> Result<Option<u64>>;

    /// Atomic whole-file write.
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Expand a wildcard pattern to concrete paths.
    fn resolve(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Build an endpoint from a URL-like prefix: `file://...`, `mem://`, or
/// a bare filesystem path.
pub fn endpoint(prefix: &str) -> Result<Arc<dyn Endpoint>> {
    if let Some(rest) = prefix.strip_prefix("file://") {
        Ok(Arc::new(FsEndpoint::new(rest)))
    } else if prefix.starts_with("mem://") {
        Ok(Arc::new(MemEndpoint::new()))
    } else if prefix.contains("://") {
        Err(Error::Config(format!(
            "unsupported endpoint scheme: {}",
            prefix
        )))
    } else {
        Ok(Arc::new(FsEndpoint::new(prefix)))
    }
}

fn retrying<T>(path: &str, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < RETRIES && e.kind() != io::ErrorKind::NotFound => {
                attempt += 1;
                warn!("retrying {} after {} ({}/{})", path, e, attempt, RETRIES);
                thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => {
                return Err(Error::Storage {
                    path: path.to_string(),
                    source: e,
                })
            }
        }
    }
}

fn wildcard_match(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((pre, suf)) => {
            name.len() >= pre.len() + suf.len()
                && name.starts_with(pre)
                && name.ends_with(suf)
        }
        None => name == pattern,
    }
}

/// Local filesystem endpoint rooted at a directory.
pub struct FsEndpoint {
    root: PathBuf,
}

impl FsEndpoint {
    pub fn new<P: Into<PathBuf>>(root: P) -> FsEndpoint {
        FsEndpoint { root: root.into() }
    }

    fn full(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Endpoint for FsEndpoint {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full(path);
        retrying(path, || fs::read(&full))
    }

    fn try_get_size(&self, path: &str) -> Result<Option<u64>> {
        match fs::metadata(self.full(path)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage {
                path: path.to_string(),
                source: e,
            }),
        }
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full(path);
        let staged = full.with_extension("partial");
        retrying(path, || {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&staged, data)?;
            fs::rename(&staged, &full)
        })
    }

    fn resolve(&self, pattern: &str) -> Result<Vec<String>> {
        if !pattern.contains('*') {
            return Ok(vec![pattern.to_string()]);
        }
        let (dir, name) = match pattern.rsplit_once('/') {
            Some((dir, name)) => (self.root.join(dir), name.to_string()),
            None => (self.root.clone(), pattern.to_string()),
        };
        let mut entries = retrying(pattern, || {
            let mut found = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if let Some(file_name) = entry.file_name().to_str() {
                    if wildcard_match(file_name, &name) {
                        found.push(match pattern.rsplit_once('/') {
                            Some((prefix, _)) => format!("{}/{}", prefix, file_name),
                            None => file_name.to_string(),
                        });
                    }
                }
            }
            Ok(found)
        })?;
        entries.sort();
        Ok(entries)
    }
}

/// In-memory endpoint for ephemeral datasets and tests.
#[derive(Default)]
pub struct MemEndpoint {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemEndpoint {
    pub fn new() -> MemEndpoint {
        MemEndpoint::default()
    }
}

impl Endpoint for MemEndpoint {
    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Storage {
                path: path.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such object"),
            })
    }

    fn try_get_size(&self, path: &str) -> Result<Option<u64>> {
        Ok(self.files.lock().get(path).map(|d| d.len() as u64))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files.lock().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn resolve(&self, pattern: &str) -> Result<Vec<String>> {
        if !pattern.contains('*') {
            return Ok(vec![pattern.to_string()]);
        }
        let mut found: Vec<String> = self
            .files
            .lock()
            .keys()
            .filter(|k| wildcard_match(k, pattern))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }
}
