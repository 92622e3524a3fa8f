use std::path::PathBuf;
use std::time::Duration;

/// Blocking transfers give up after this long.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Highest channel id the registry accepts.
pub const MAX_CHANNEL_ID: i32 = 100;

pub const CHRDEV_NAME: &str = "axidma";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub timeout: Duration,
    pub max_channel_id: i32,
    pub chrdev_name: String,
    pub device_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: DEFAULT_TIMEOUT,
            max_channel_id: MAX_CHANNEL_ID,
            chrdev_name: CHRDEV_NAME.to_string(),
            device_path: PathBuf::from(format!("/dev/{}", CHRDEV_NAME)),
        }
    }
}

impl Config {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_channel_id(mut self, id: i32) -> Self {
        self.max_channel_id = id;
        self
    }

    /// Renames the character device; the device path follows the name.
    pub fn with_chrdev_name(mut self, name: &str) -> Self {
        self.chrdev_name = name.to_string();
        self.device_path = PathBuf::from(format!("/dev/{}", name));
        self
    }
}
