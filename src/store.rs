//! JSON-backed state files
//!
//! Every persisted collection (devices, zones, firewall rules, DHCP config)
//! is a single JSON document. A missing file yields the default value; an
//! unreadable or undecodable file is an error.

use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Load a JSON document, or `T::default()` if the file does not exist.
pub fn load_or_default<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        info!("{} not found, initializing empty", path.display());
        return Ok(T::default());
    }

    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(T::default());
    }

    let value = serde_json::from_str(&contents)?;
    debug!("Loaded {}", path.display());
    Ok(value)
}

/// Write a JSON document atomically with owner-only permissions.
pub fn save<T, P>(path: P, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(value)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    debug!("Saved {}", path.display());
    Ok(())
}
