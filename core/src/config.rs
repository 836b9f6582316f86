/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PREVIEW_CHARS: usize = 80;
const DEFAULT_DEDUP_WINDOW: usize = 64;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the sled store; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    /// Maximum characters kept in a room's last message preview
    pub preview_max_chars: usize,

    /// How many recent messages are checked for a repeated client message id
    pub dedup_window: usize,

    /// Page size used for history reads and synchronizer backfill
    pub page_size: usize,

    /// Reconnect attempts before a subscription reports an error
    pub sync_max_retries: u32,

    /// First reconnect delay
    pub sync_initial_backoff: Duration,

    /// Upper bound for the reconnect delay
    pub sync_max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            preview_max_chars: DEFAULT_PREVIEW_CHARS,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            page_size: 100,
            sync_max_retries: 5,
            sync_initial_backoff: Duration::from_millis(100),
            sync_max_backoff: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// In-memory configuration with the default tuning
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration backed by a sled store under `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }

    /// Parse flags out of command line arguments.
    ///
    /// Returns the config plus the positional arguments left over (the
    /// command and its operands). `args[0]` is the binary name and is skipped.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--in-memory" => {
                    config.data_dir = None;
                    i += 1;
                }
                "--preview-chars" => {
                    config.preview_max_chars = parse_flag(args.get(i + 1), "--preview-chars")?;
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = parse_flag(args.get(i + 1), "--page-size")?;
                    i += 2;
                }
                "--max-retries" => {
                    config.sync_max_retries = parse_flag(args.get(i + 1), "--max-retries")?;
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(n) = std::env::var("CHATSYNC_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.page_size = n;
        }
        if let Some(n) = std::env::var("CHATSYNC_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            config.sync_max_retries = n;
        }

        config.validate()?;
        Ok((config, rest))
    }

    /// Reject settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        if self.preview_max_chars == 0 {
            return Err(SyncError::Config(
                "preview_max_chars must be at least 1".to_string(),
            ));
        }
        if self.sync_initial_backoff > self.sync_max_backoff {
            return Err(SyncError::Config(
                "sync_initial_backoff exceeds sync_max_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag<T: std::str::FromStr>(value: Option<&String>, flag: &str) -> Result<T> {
    let raw = value.ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flags_and_positionals() {
        let (config, rest) = Config::from_args(&args(&[
            "chatsync",
            "--data-dir",
            "/tmp/chat",
            "send",
            "--page-size",
            "20",
            "room1",
        ]))
        .unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/chat")));
        assert_eq!(config.page_size, 20);
        assert_eq!(rest, vec!["send".to_string(), "room1".to_string()]);
    }

    #[test]
    fn test_missing_flag_value() {
        let err = Config::from_args(&args(&["chatsync", "--page-size"])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let config = Config {
            page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
