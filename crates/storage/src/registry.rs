//! Device Registry

use crate::timeseries::FileKey;
use crate::{write_atomic, StorageError};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted metadata for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Sequence number assigned in first-seen order, starting at 1
    pub device_number: u32,
    /// Name of the device's current time-series file
    #[serde(default)]
    pub csv_file: String,
}

/// Outcome of [`DeviceRegistry::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Existing(DeviceEntry),
    New(DeviceEntry),
}

impl Registration {
    pub fn entry(&self) -> &DeviceEntry {
        match self {
            Registration::Existing(entry) | Registration::New(entry) => entry,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::New(_))
    }
}

/// Device identity to metadata, persisted as one JSON document
pub struct DeviceRegistry {
    path: PathBuf,
    devices: BTreeMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    /// Load the registry; a missing file yields an empty registry
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let devices = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<BTreeMap<String, DeviceEntry>>(&text)
                .map_err(|e| StorageError::SerializationError(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        info!("Loaded {} devices from {}", devices.len(), path.display());
        Ok(Self { path, devices })
    }

    /// Look up a device
    pub fn get(&self, device: &str) -> Option<&DeviceEntry> {
        self.devices.get(device)
    }

    /// Return the device's entry, creating one if the device is unknown.
    /// New devices get the next sequence number and a file for the month of
    /// `seen_at`.
    pub fn register(&mut self, device: &str, seen_at: &DateTime<FixedOffset>) -> Registration {
        if let Some(entry) = self.devices.get(device) {
            return Registration::Existing(entry.clone());
        }

        let device_number = self.devices.values().map(|e| e.device_number).max().unwrap_or(0) + 1;
        let entry = DeviceEntry {
            device_number,
            csv_file: FileKey::for_hour(device_number, seen_at).file_name(),
        };
        self.devices.insert(device.to_string(), entry.clone());
        info!("Device {} has been added with device number {}", device, device_number);
        Registration::New(entry)
    }

    /// Record the device's current output file; returns whether it changed
    pub fn set_file(&mut self, device: &str, key: &FileKey) -> bool {
        match self.devices.get_mut(device) {
            Some(entry) => {
                let name = key.file_name();
                if entry.csv_file == name {
                    return false;
                }
                info!("Device {} rotated to {}", device, name);
                entry.csv_file = name;
                true
            }
            None => false,
        }
    }

    /// Rewrite the registry file in full
    pub fn save(&self) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(&self.devices)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes())?;
        debug!("Saved {} devices to {}", self.devices.len(), self.path.display());
        Ok(())
    }

    /// Devices in identity order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceEntry)> {
        self.devices.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Device identities
    pub fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if no device is registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Registry file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(month: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, month, 3, 9, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::load(dir.path().join("devices.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sequence_numbers_in_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("devices.json")).unwrap();

        assert!(registry.register("sensor-B", &at(6)).is_new());
        assert!(registry.register("sensor-A", &at(6)).is_new());
        let again = registry.register("sensor-B", &at(6));

        assert!(!again.is_new());
        assert_eq!(again.entry().device_number, 1);
        assert_eq!(registry.get("sensor-A").unwrap().device_number, 2);
        assert_eq!(
            registry.get("sensor-A").unwrap().csv_file,
            "device_2_temperature_data_2024-06.csv"
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let mut registry = DeviceRegistry::load(&path).unwrap();
        registry.register("0xa4c1383628a7fd0c", &at(6));
        registry.save().unwrap();

        let reloaded = DeviceRegistry::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.get("0xa4c1383628a7fd0c"),
            registry.get("0xa4c1383628a7fd0c")
        );

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["0xa4c1383628a7fd0c"]["device_number"], 1);
    }

    #[test]
    fn test_set_file_on_month_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("devices.json")).unwrap();
        registry.register("sensor-A", &at(6));

        assert!(!registry.set_file("sensor-A", &FileKey::for_hour(1, &at(6))));
        assert!(registry.set_file("sensor-A", &FileKey::for_hour(1, &at(7))));
        assert_eq!(
            registry.get("sensor-A").unwrap().csv_file,
            "device_1_temperature_data_2024-07.csv"
        );
    }

    #[test]
    fn test_corrupt_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            DeviceRegistry::load(&path),
            Err(StorageError::SerializationError(_))
        ));
    }
}
