//! Sidecar metadata written next to every rotated file
//!
//! The sidecar lives at `<data file>.meta.json` and shares the data file's
//! lifecycle: written when the file is opened, rewritten with final counts
//! when it is closed, removed together with it.

use logship_common::{Error, LogId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix appended to the data file name
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Property holding the content version (schema hash)
pub const VERSION_PROPERTY: &str = "VERSION";

/// Property holding the number of rows, set when the file is closed
pub const ROW_COUNT_PROPERTY: &str = "ROW_COUNT";

/// Metadata describing one rotated file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub file_prefix_pattern: String,
    pub log_type: String,
    pub client_hostname: String,
    pub headers: Vec<String>,
    pub types: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl Sidecar {
    /// Build the sidecar for a file opened for `log_id`
    pub fn for_log_id(log_id: &LogId) -> Self {
        let mut properties = log_id.properties.clone();
        properties.insert(
            VERSION_PROPERTY.to_string(),
            format!("{:016x}", log_id.schema_hash()),
        );
        Self {
            file_prefix_pattern: log_id.file_prefix_pattern.clone(),
            log_type: log_id.log_type.clone(),
            client_hostname: log_id.client_hostname.clone(),
            headers: log_id.headers.clone(),
            types: log_id.column_types.clone(),
            properties,
        }
    }

    /// Content version recorded at open
    pub fn content_version(&self) -> Option<&str> {
        self.properties.get(VERSION_PROPERTY).map(String::as_str)
    }

    /// Sidecar location for a data file
    pub fn path_for(data_file: &Path) -> PathBuf {
        let mut name = data_file.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Write the sidecar next to `data_file` (temp file + rename)
    pub fn write(&self, data_file: &Path) -> Result<()> {
        let path = Self::path_for(data_file);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Sidecar(format!("encode {}: {e}", path.display())))?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp).map_err(|e| Error::writer(&tmp, e))?;
            file.write_all(&json).map_err(|e| Error::writer(&tmp, e))?;
            file.sync_all().map_err(|e| Error::writer(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| Error::writer(&path, e))?;
        Ok(())
    }

    /// Read the sidecar of `data_file`
    pub fn read(data_file: &Path) -> Result<Self> {
        let path = Self::path_for(data_file);
        let json = fs::read(&path).map_err(|e| Error::writer(&path, e))?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::Sidecar(format!("decode {}: {e}", path.display())))
    }

    /// Delete a data file together with its sidecar
    pub fn remove_with(data_file: &Path) -> Result<()> {
        for path in [data_file.to_path_buf(), Self::path_for(data_file)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::writer(path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_id() -> LogId {
        LogId {
            file_prefix_pattern: "{log_type}/{HH}{mm}.{version}".into(),
            log_type: "access".into(),
            client_hostname: "web-1".into(),
            properties: BTreeMap::from([("shard".to_string(), "0".to_string())]),
            headers: vec!["ts".into(), "msg".into()],
            column_types: vec!["long".into(), "string".into()],
        }
    }

    #[test]
    fn test_sidecar_roundtrip() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("0100.1.tsv");
        fs::write(&data, b"").unwrap();

        let sidecar = Sidecar::for_log_id(&log_id());
        sidecar.write(&data).unwrap();

        assert!(dir.path().join("0100.1.tsv.meta.json").exists());
        let restored = Sidecar::read(&data).unwrap();
        assert_eq!(restored, sidecar);
        assert_eq!(restored.properties["shard"], "0");
        assert_eq!(
            restored.content_version().unwrap(),
            format!("{:016x}", log_id().schema_hash())
        );
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(Sidecar::for_log_id(&log_id())).unwrap();
        assert_eq!(json["filePrefixPattern"], "{log_type}/{HH}{mm}.{version}");
        assert_eq!(json["clientHostname"], "web-1");
        assert_eq!(json["types"][0], "long");
    }

    #[test]
    fn test_version_tracks_schema() {
        let mut other = log_id();
        other.headers[1] = "message".into();
        assert_ne!(
            Sidecar::for_log_id(&log_id()).content_version(),
            Sidecar::for_log_id(&other).content_version()
        );
    }

    #[test]
    fn test_remove_with_data_file() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("f.tsv");
        fs::write(&data, b"x").unwrap();
        Sidecar::for_log_id(&log_id()).write(&data).unwrap();

        Sidecar::remove_with(&data).unwrap();
        assert!(!data.exists());
        assert!(!Sidecar::path_for(&data).exists());
        Sidecar::remove_with(&data).unwrap();
    }
}
