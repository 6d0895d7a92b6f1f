//! Startup configuration: a JSON document describing the
//! services to register before the reactor loop starts. Grounded on
//! `manager_read_config`'s 0xffff-byte read buffer and "missing file means
//! empty config" behavior in `examples/original_source/src/main.c`, expressed
//! with `serde`/`serde_json` the way the rest of this codebase loads JSON.

use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::service::Executable;

/// Largest startup config file this daemon will read. The original's read
/// buffer is `0xffff` (65535) bytes wide and a file that exactly fills it
/// leaves no room for the trailing NUL its reader expects, so 65535 bytes
/// is already too large; the largest acceptable file is one byte smaller.
pub const MAX_CONFIG_BYTES: u64 = 0xffff - 1;

#[derive(Debug, Deserialize)]
pub struct ExecutableSpec {
    pub path: String,
    #[serde(default, rename = "user_id")]
    pub uid: u32,
    #[serde(default, rename = "group_id")]
    pub gid: u32,
}

#[derive(Debug, Deserialize)]
pub struct ServiceSpec {
    pub address: String,
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub executable: Option<ExecutableSpec>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub activate_at_startup: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl ServiceSpec {
    pub fn into_executable(self) -> Option<Executable> {
        self.executable.map(|e| Executable {
            path: e.path.into(),
            uid: e.uid,
            gid: e.gid,
        })
    }
}

/// Load the startup config. A missing file is treated as `{"services": []}`;
/// an oversized or malformed one is a hard startup error.
pub fn load(path: &Path) -> Result<Config, Error> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(Error::Config(format!("cannot stat {}: {e}", path.display()))),
    };

    if metadata.len() > MAX_CONFIG_BYTES {
        return Err(Error::Config(format!(
            "{} is {} bytes, exceeding the {MAX_CONFIG_BYTES}-byte limit",
            path.display(),
            metadata.len()
        )));
    }

    let bytes = std::fs::read(path).map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Config(format!("malformed config {}: {e}", path.display())))
}
