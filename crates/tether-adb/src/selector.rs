//! Device selectors: how a host request names its target device.

use std::fmt;

/// Identifies the device a request is aimed at. Immutable; construct one per
/// request and never cache it across reconnects (serials are transient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSelector {
    target: DeviceTarget,
    track_transport_id: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum DeviceTarget {
    Any,
    Usb,
    Local,
    Serial(String),
    TransportId(u64),
}

impl DeviceSelector {
    pub fn any() -> Self {
        Self::new(DeviceTarget::Any)
    }

    pub fn usb() -> Self {
        Self::new(DeviceTarget::Usb)
    }

    pub fn local() -> Self {
        Self::new(DeviceTarget::Local)
    }

    pub fn serial(serial: impl Into<String>) -> Self {
        Self::new(DeviceTarget::Serial(serial.into()))
    }

    pub fn transport_id(id: u64) -> Self {
        Self::new(DeviceTarget::TransportId(id))
    }

    fn new(target: DeviceTarget) -> Self {
        Self {
            target,
            track_transport_id: false,
        }
    }

    /// Switch to the `host:tport:` transport-selection variant, which reports
    /// the daemon-assigned transport id (8 bytes little-endian) after OKAY.
    /// No-op for [`DeviceSelector::transport_id`] targets, where the id is
    /// already known.
    pub fn with_transport_id_tracking(mut self) -> Self {
        self.track_transport_id = !matches!(self.target, DeviceTarget::TransportId(_));
        self
    }

    /// Whether the transport switch response carries a transport id.
    pub fn returns_transport_id(&self) -> bool {
        self.track_transport_id
    }

    /// Prefix for device-scoped host queries that do not switch the
    /// connection to the device (e.g. `host-serial:<sn>:<query>`).
    pub fn host_prefix(&self) -> String {
        match &self.target {
            DeviceTarget::Any => "host".to_string(),
            DeviceTarget::Usb => "host-usb".to_string(),
            DeviceTarget::Local => "host-local".to_string(),
            DeviceTarget::Serial(serial) => format!("host-serial:{serial}"),
            DeviceTarget::TransportId(id) => format!("host-transport-id:{id}"),
        }
    }

    /// The transport-selection service string.
    pub fn transport_service(&self) -> String {
        if self.track_transport_id {
            match &self.target {
                DeviceTarget::Any => "host:tport:any".to_string(),
                DeviceTarget::Usb => "host:tport:usb".to_string(),
                DeviceTarget::Local => "host:tport:local".to_string(),
                DeviceTarget::Serial(serial) => format!("host:tport:serial:{serial}"),
                // Unreachable by construction; fall through to the legacy form.
                DeviceTarget::TransportId(id) => format!("host:transport-id:{id}"),
            }
        } else {
            match &self.target {
                DeviceTarget::Any => "host:transport-any".to_string(),
                DeviceTarget::Usb => "host:transport-usb".to_string(),
                DeviceTarget::Local => "host:transport-local".to_string(),
                DeviceTarget::Serial(serial) => format!("host:transport:{serial}"),
                DeviceTarget::TransportId(id) => format!("host:transport-id:{id}"),
            }
        }
    }

    /// Serial this selector names, when it names one directly.
    pub fn serial_number(&self) -> Option<&str> {
        match &self.target {
            DeviceTarget::Serial(serial) => Some(serial),
            _ => None,
        }
    }

    pub fn transport_id_value(&self) -> Option<u64> {
        match self.target {
            DeviceTarget::TransportId(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            DeviceTarget::Any => write!(f, "any device"),
            DeviceTarget::Usb => write!(f, "any USB device"),
            DeviceTarget::Local => write!(f, "any emulator"),
            DeviceTarget::Serial(serial) => write!(f, "serial {serial}"),
            DeviceTarget::TransportId(id) => write!(f, "transport id {id}"),
        }
    }
}
