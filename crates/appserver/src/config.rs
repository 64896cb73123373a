//! Launch configuration of one application instance.

use std::path::Path;
use std::path::PathBuf;

pub use appwire::APP_KEY_ENV;
pub use appwire::SOCK_FILE_ENV;

/// How to launch one application instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub binary_dir: PathBuf,
    pub name: String,
    pub version: String,
    pub work_dir: PathBuf,
    /// Path of the private control-channel socket.
    pub sock_file: PathBuf,
}

impl Config {
    /// `<binary_dir>/<name>.v<version>`.
    pub fn binary_path(&self) -> PathBuf {
        binary_path(&self.binary_dir, &self.name, &self.version)
    }
}

pub fn binary_path(dir: &Path, name: &str, version: &str) -> PathBuf {
    dir.join(format!("{}.v{}", name, version))
}
