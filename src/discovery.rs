use std::fmt;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::error::{Error, Result};

/// Transport family a device is reachable over.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    UsbVsc = 0,
    UsbCdc = 1,
    Pcie = 2,
    Ipc = 3,
    TcpIp = 4,
    #[default]
    Any = 5,
}

/// Device family, when known.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Platform {
    #[default]
    Any = 0,
    Myriad2 = 2450,
    MyriadX = 2480,
    KeemBay = 3000,
}

/// Boot state a search can be narrowed to.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Any = 0,
    Booted = 1,
    Unbooted = 2,
    Bootloader = 3,
    FlashBooted = 4,
    Gate = 5,
}

/// One discovered endpoint.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DeviceDesc {
    pub name: String,
    pub protocol: Protocol,
    pub platform: Platform,
    pub state: DeviceState,
    pub mx_id: String,
    /// Why the device cannot be used right now, if it cannot.
    pub status: Option<Error>,
}

impl fmt::Display for DeviceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.protocol, self.state)
    }
}

/// Search filter; default matches everything.
#[derive(Default, Debug, Clone)]
pub struct DeviceFilter {
    pub protocol: Protocol,
    pub platform: Platform,
    pub state: DeviceState,
    /// Empty matches any name, otherwise a prefix.
    pub name: String,
}

impl DeviceFilter {
    pub fn matches(&self, desc: &DeviceDesc) -> bool {
        (self.protocol == Protocol::Any || self.protocol == desc.protocol)
            && (self.platform == Platform::Any || self.platform == desc.platform)
            && (self.state == DeviceState::Any || self.state == desc.state)
            && (self.name.is_empty() || desc.name.starts_with(&self.name))
    }
}

/// Enumeration backend. The engine itself never probes hardware; providers
/// registered at [`crate::api::initialize`] supply the devices.
pub trait DeviceDiscovery: Send + Sync {
    fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<DeviceDesc>>;
}

lazy_static! {
    static ref PROVIDERS: Mutex<Vec<Arc<dyn DeviceDiscovery>>> = Mutex::new(vec![]);
}

pub fn register_provider(provider: Arc<dyn DeviceDiscovery>) {
    PROVIDERS.lock().unwrap().push(provider);
}

#[cfg(test)]
pub(crate) fn clear_providers() {
    PROVIDERS.lock().unwrap().clear();
}

/// Every reachable device matching the filter, in provider order.
pub fn find_all_suitable_devices(filter: &DeviceFilter) -> Result<Vec<DeviceDesc>> {
    let providers: Vec<Arc<dyn DeviceDiscovery>> = {
        let list = PROVIDERS.lock().unwrap();
        list.clone()
    };

    let mut found = vec![];
    for provider in providers {
        let devices = provider.find_devices(filter)?;
        found.extend(devices.into_iter().filter(|d| filter.matches(d)));
    }
    Ok(found)
}

/// First reachable device matching the filter.
pub fn find_first_suitable_device(filter: &DeviceFilter) -> Result<DeviceDesc> {
    find_all_suitable_devices(filter)?
        .into_iter()
        .next()
        .ok_or(Error::ErrDeviceNotFound)
}
