//! Per-bridge `config.json`: tokens and account secrets kept next to the
//! PID and inbox files.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::Result;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// `<data>/<bridge>/config.json`.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

/// Read the raw object. A missing or unparseable file is an empty object.
pub fn load_raw(dir: &Path) -> Map<String, Value> {
    let path = config_path(dir);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(path = %path.display(), "ignoring malformed config file");
            Map::new()
        }
    }
}

/// Typed view of `config.json`, falling back to `T::default()`.
pub fn load<T: DeserializeOwned + Default>(dir: &Path) -> T {
    serde_json::from_value(Value::Object(load_raw(dir))).unwrap_or_default()
}

/// Write `value` as pretty JSON, creating the directory if needed.
pub fn save<T: Serialize>(dir: &Path, value: &T) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(config_path(dir), text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default)]
        token: String,
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load::<Sample>(dir.path()), Sample::default());
        assert!(load_raw(dir.path()).is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("crm");
        save(&nested, &Sample { token: "abc".into() }).unwrap();
        assert_eq!(load::<Sample>(&nested).token, "abc");
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(config_path(dir.path()), "[1, 2").unwrap();
        assert!(load_raw(dir.path()).is_empty());
    }
}
