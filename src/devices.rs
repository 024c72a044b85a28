//! Device registry
//!
//! Ordered list of capture devices plus the current selection. The list is
//! filled by enumeration and only replaced on explicit re-enumeration.

use std::fmt;

/// Identifier of a capture device as understood by its backend
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Selector meaning "whatever device the registry lists first"
    pub const DEFAULT: &'static str = "default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_device() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::default_device()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Information about an available camera
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Backend identifier
    pub id: DeviceId,
    /// Human readable name
    pub label: String,
}

impl Device {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capture device: {0}")]
pub struct UnknownDevice(pub String);

/// Enumerated devices and the active selection
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    selected: Option<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the device list with a fresh enumeration.
    ///
    /// The previous selection survives if the device is still present,
    /// otherwise the first listed device becomes selected.
    pub fn replace(&mut self, devices: Vec<Device>) {
        let keep = self
            .selected
            .as_ref()
            .filter(|id| devices.iter().any(|d| &d.id == *id))
            .cloned();

        self.selected = keep.or_else(|| devices.first().map(|d| d.id.clone()));
        self.devices = devices;

        log::info!(
            "Device list refreshed: {} device(s), selected {:?}",
            self.devices.len(),
            self.selected.as_ref().map(DeviceId::as_str)
        );
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device, mapping the `default` selector to the first entry
    pub fn resolve(&self, id: &DeviceId) -> Option<&Device> {
        if id.is_default() {
            self.devices.first()
        } else {
            self.devices.iter().find(|d| &d.id == id)
        }
    }

    /// Make `id` the active device
    pub fn select(&mut self, id: &DeviceId) -> Result<&Device, UnknownDevice> {
        let index = if id.is_default() {
            (!self.devices.is_empty()).then_some(0)
        } else {
            self.devices.iter().position(|d| &d.id == id)
        };

        let index = index.ok_or_else(|| UnknownDevice(id.to_string()))?;
        self.selected = Some(self.devices[index].id.clone());
        Ok(&self.devices[index])
    }

    /// Currently selected device, `None` until enumeration has found one
    pub fn selected(&self) -> Option<&Device> {
        let id = self.selected.as_ref()?;
        self.devices.iter().find(|d| &d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cameras() -> Vec<Device> {
        vec![Device::new("0", "FaceTime HD"), Device::new("1", "USB Camera")]
    }

    #[test]
    fn test_selection_empty_until_enumerated() {
        let registry = DeviceRegistry::new();
        assert!(registry.selected().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replace_selects_first() {
        let mut registry = DeviceRegistry::new();
        registry.replace(two_cameras());
        assert_eq!(registry.selected().map(|d| d.label.as_str()), Some("FaceTime HD"));
    }

    #[test]
    fn test_replace_keeps_existing_selection() {
        let mut registry = DeviceRegistry::new();
        registry.replace(two_cameras());
        registry.select(&DeviceId::new("1")).unwrap();

        registry.replace(two_cameras());
        assert_eq!(registry.selected().unwrap().id.as_str(), "1");

        // Selected device unplugged
        registry.replace(vec![Device::new("0", "FaceTime HD")]);
        assert_eq!(registry.selected().unwrap().id.as_str(), "0");
    }

    #[test]
    fn test_select_and_resolve() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.select(&DeviceId::default_device()).unwrap_err(),
            UnknownDevice("default".to_string())
        );

        registry.replace(two_cameras());
        assert_eq!(registry.resolve(&DeviceId::default_device()).unwrap().id.as_str(), "0");
        assert_eq!(registry.resolve(&"1".into()).unwrap().label, "USB Camera");
        assert!(registry.resolve(&"7".into()).is_none());
        assert!(registry.select(&"7".into()).is_err());
    }
}
