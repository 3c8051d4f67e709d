//! Device and session identifier types
//!
//! This module defines the identifiers exchanged with callers: device paths
//! (what enumeration reports) and sessions (what acquire hands out), plus the
//! device descriptor that makes up an enumeration snapshot.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Vendor id reported for virtual endpoints and used as the default HID filter
pub const DEVICE_VENDOR_ID: u16 = 0x534c;

/// Product id reported for virtual endpoints and used as the default HID filter
pub const DEVICE_PRODUCT_ID: u16 = 0x0001;

/// HID usage page of the U2F interface, which never carries wire protocol traffic
pub const U2F_USAGE_PAGE: u16 = 0xf1d0;

const UDP_PREFIX: &str = "udp";

/// Transport family a path or session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// USB HID device
    Hid,
    /// Loopback UDP endpoint (emulator)
    Udp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Hid => write!(f, "hid"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// Error returned when an identifier text cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Device identifier
///
/// Stable for as long as the endpoint stays attached. HID devices are named by
/// a driver-assigned number, loopback endpoints by their configured port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DevicePath {
    /// HID device id (assigned at enumeration)
    Hid(u32),
    /// Loopback endpoint bound to a configured UDP port
    Udp(u16),
}

impl DevicePath {
    /// Transport family serving this path
    pub fn kind(&self) -> TransportKind {
        match self {
            DevicePath::Hid(_) => TransportKind::Hid,
            DevicePath::Udp(_) => TransportKind::Udp,
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePath::Hid(id) => write!(f, "{}", id),
            DevicePath::Udp(port) => write!(f, "{}{}", UDP_PREFIX, port),
        }
    }
}

impl FromStr for DevicePath {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(port) = s.strip_prefix(UDP_PREFIX) {
            return port
                .parse::<u16>()
                .map(DevicePath::Udp)
                .map_err(|_| InvalidIdentifier(s.to_string()));
        }
        s.parse::<u32>()
            .map(DevicePath::Hid)
            .map_err(|_| InvalidIdentifier(s.to_string()))
    }
}

/// Connection handle returned by a transport's connect
///
/// Lives in its own namespace: a session number never names a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {
    /// Open HID connection
    Hid(u32),
    /// Open loopback socket
    Udp(u32),
}

impl Session {
    /// Transport family that owns this session
    pub fn kind(&self) -> TransportKind {
        match self {
            Session::Hid(_) => TransportKind::Hid,
            Session::Udp(_) => TransportKind::Udp,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Session::Hid(id) => write!(f, "{}", id),
            Session::Udp(id) => write!(f, "{}{}", UDP_PREFIX, id),
        }
    }
}

impl FromStr for Session {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(id) = s.strip_prefix(UDP_PREFIX) {
            return id
                .parse::<u32>()
                .map(Session::Udp)
                .map_err(|_| InvalidIdentifier(s.to_string()));
        }
        s.parse::<u32>()
            .map(Session::Hid)
            .map_err(|_| InvalidIdentifier(s.to_string()))
    }
}

/// Identifiers travel as text but callers often send plain numbers
struct IdentifierVisitor<T>(std::marker::PhantomData<T>);

impl<T: FromStr> Visitor<'_> for IdentifierVisitor<T> {
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an identifier string or non-negative number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<T, E> {
        v.parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<T, E> {
        self.visit_str(&v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<T, E> {
        if v < 0 {
            return Err(E::invalid_value(de::Unexpected::Signed(v), &self));
        }
        self.visit_str(&v.to_string())
    }
}

macro_rules! text_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(IdentifierVisitor(std::marker::PhantomData))
            }
        }
    };
}

text_serde!(DevicePath);
text_serde!(Session);

/// One entry of an enumeration snapshot
///
/// Serialized in the shape callers expect:
/// `{"path", "vendor", "product", "serialNumber": 0, "session"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device identifier
    pub path: DevicePath,
    /// USB vendor id
    #[serde(default)]
    pub vendor: u16,
    /// USB product id
    #[serde(default)]
    pub product: u16,
    /// Always zero; kept for caller compatibility
    #[serde(rename = "serialNumber", default)]
    pub serial_number: u32,
    /// Live session on this device, if any
    #[serde(default)]
    pub session: Option<Session>,
}
