//! Locations of CostPulse's on-disk state.

use std::path::PathBuf;

use crate::error::{CostPulseError, Result};

/// Environment variable that overrides the data directory.
pub const HOME_ENV: &str = "COSTPULSE_HOME";

/// Data document holding settings and usage history.
pub const DATA_FILE_NAME: &str = "costpulse.json";

/// Persisted log tail offsets.
pub const OFFSETS_FILE_NAME: &str = "log_offsets.json";

/// Resolve the data directory.
///
/// `$COSTPULSE_HOME` wins, then the platform data directory, then
/// `~/.costpulse`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.trim().is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join("costpulse"));
    }
    dirs::home_dir()
        .map(|home| home.join(".costpulse"))
        .ok_or_else(|| CostPulseError::DataDirectory {
            message: "no home or data directory for this user".to_string(),
        })
}

/// Path of the data document.
pub fn data_file() -> Result<PathBuf> {
    Ok(data_dir()?.join(DATA_FILE_NAME))
}

/// Path of the offset ledger.
pub fn offsets_file() -> Result<PathBuf> {
    Ok(data_dir()?.join(OFFSETS_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_home_override() {
        let tmp = TempDir::new().unwrap();
        // SAFETY: serialized with every other test touching COSTPULSE_HOME
        unsafe { std::env::set_var(HOME_ENV, tmp.path()) };

        assert_eq!(data_dir().unwrap(), tmp.path());
        assert_eq!(data_file().unwrap(), tmp.path().join("costpulse.json"));
        assert_eq!(offsets_file().unwrap(), tmp.path().join("log_offsets.json"));

        unsafe { std::env::remove_var(HOME_ENV) };
    }
}
