//! USB HID transport over libusb
//!
//! libusb calls block, so every operation runs on the blocking thread pool.
//! Devices get a numeric id per (bus, address) that stays stable while the
//! device is attached; the probed interface layout is cached under that id so
//! enumeration does not reopen devices that were already inspected.

use super::{CloseHandle, CloseSignal, Endpoint, Transport};
use crate::config::DeviceFilter;
use async_trait::async_trait;
use common::{Error, Result};
use protocol::{DevicePath, Framing, PACKET_SIZE, Packet, Session, TransportKind, U2F_USAGE_PAGE};
use rusb::{
    Context, Device, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// USB interface class code for HID
const HID_CLASS: u8 = 0x03;

/// HID class descriptor type of the report descriptor
const REPORT_DESCRIPTOR_TYPE: u16 = 0x22;

/// Standard GET_DESCRIPTOR request
const GET_DESCRIPTOR: u8 = 0x06;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Reads wake up this often to notice a closed connection
const READ_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bound on waiting for in-flight transfers; covers a stalled write
const CLOSE_TIMEOUT: Duration = Duration::from_millis(5500);

/// Summary of the items in a HID report descriptor we care about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReportDescriptorInfo {
    /// First Usage Page item
    pub usage_page: Option<u16>,
    /// Descriptor contains a Report ID item
    pub has_report_id: bool,
}

/// Walk the short items of a report descriptor
pub(crate) fn parse_report_descriptor(bytes: &[u8]) -> ReportDescriptorInfo {
    let mut info = ReportDescriptorInfo::default();
    let mut i = 0;

    while i < bytes.len() {
        let prefix = bytes[i];

        // Long item: [0xfe][size][tag][data...]
        if prefix == 0xfe {
            let size = bytes.get(i + 1).copied().unwrap_or(0) as usize;
            i += 3 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let end = (i + 1 + size).min(bytes.len());
        let value = bytes[i + 1..end]
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));

        match prefix & 0xfc {
            0x04 if info.usage_page.is_none() => info.usage_page = Some(value as u16),
            0x84 => info.has_report_id = true,
            _ => {}
        }

        i += 1 + size;
    }

    info
}

/// Interface chosen for wire protocol traffic
#[derive(Debug, Clone, Copy)]
struct HidInterface {
    bus: u8,
    address: u8,
    vendor: u16,
    product: u16,
    number: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    has_report_id: bool,
}

struct HidConnection {
    handle: DeviceHandle<Context>,
    interface: HidInterface,
    close: CloseHandle,
}

/// A connection borrowed by one transfer
struct InFlight {
    connection: Arc<HidConnection>,
    // Declared after the connection so it is dropped last
    signal: CloseSignal,
}

#[derive(Default)]
struct HidState {
    /// (bus, address) -> device id
    ids: HashMap<(u8, u8), u32>,
    /// device id -> probed interface
    interfaces: HashMap<u32, HidInterface>,
    connections: HashMap<u32, Arc<HidConnection>>,
    next_device_id: u32,
    next_session_id: u32,
}

impl HidState {
    fn device_id(&mut self, key: (u8, u8)) -> u32 {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        self.next_device_id += 1;
        self.ids.insert(key, self.next_device_id);
        self.next_device_id
    }

    fn connection(&self, session: &Session) -> Result<&Arc<HidConnection>> {
        let Session::Hid(id) = session else {
            return Err(Error::InvalidSession(session.to_string()));
        };
        self.connections
            .get(id)
            .ok_or_else(|| Error::InvalidSession(session.to_string()))
    }

    /// Signal and connection are taken under the state lock, so a
    /// disconnect either sees this transfer or the transfer sees no session
    fn in_flight(&self, session: &Session) -> Result<InFlight> {
        let connection = self.connection(session)?;
        Ok(InFlight {
            connection: connection.clone(),
            signal: connection.close.signal(),
        })
    }
}

/// Map rusb errors onto the transport error classes
fn map_rusb_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::NoDevice | rusb::Error::NotFound => Error::DeviceUnavailable,
        other => Error::TransferFailed(other.to_string()),
    }
}

pub struct HidTransport {
    context: Context,
    filters: Vec<DeviceFilter>,
    state: Arc<Mutex<HidState>>,
}

impl HidTransport {
    pub fn new(filters: Vec<DeviceFilter>) -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            filters,
            state: Arc::new(Mutex::new(HidState::default())),
        })
    }

    fn lock(state: &Mutex<HidState>) -> Result<MutexGuard<'_, HidState>> {
        state
            .lock()
            .map_err(|_| Error::TransferFailed("HID state lock poisoned".into()))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Context, Arc<Mutex<HidState>>) -> Result<T> + Send + 'static,
    {
        let context = self.context.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || f(context, state))
            .await
            .map_err(|e| Error::TransferFailed(format!("HID task failed: {}", e)))?
    }
}

/// Find the HID interface that carries wire protocol traffic
fn probe_interface(device: &Device<Context>, vendor: u16, product: u16) -> rusb::Result<Option<HidInterface>> {
    let config = device.active_config_descriptor()?;
    let handle = device.open()?;

    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            if alt.class_code() != HID_CLASS {
                continue;
            }

            let mut in_endpoint = None;
            let mut out_endpoint = None;
            for endpoint in alt.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => in_endpoint = Some(endpoint.address()),
                    Direction::Out => out_endpoint = Some(endpoint.address()),
                }
            }
            let (Some(in_endpoint), Some(out_endpoint)) = (in_endpoint, out_endpoint) else {
                continue;
            };

            let number = alt.interface_number();
            let mut buf = [0u8; 4096];
            let len = handle.read_control(
                rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface),
                GET_DESCRIPTOR,
                REPORT_DESCRIPTOR_TYPE << 8,
                u16::from(number),
                &mut buf,
                CONTROL_TIMEOUT,
            )?;
            let report = parse_report_descriptor(&buf[..len]);

            if report.usage_page == Some(U2F_USAGE_PAGE) {
                debug!("Skipping U2F interface {} on {:04x}:{:04x}", number, vendor, product);
                continue;
            }

            return Ok(Some(HidInterface {
                bus: device.bus_number(),
                address: device.address(),
                vendor,
                product,
                number,
                in_endpoint,
                out_endpoint,
                has_report_id: report.has_report_id,
            }));
        }
    }

    Ok(None)
}

#[async_trait]
impl Transport for HidTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Hid
    }

    async fn enumerate(&self) -> Result<Vec<Endpoint>> {
        let filters = self.filters.clone();
        self.blocking(move |context, state| {
            let devices = context.devices().map_err(map_rusb_error)?;
            let mut state = HidTransport::lock(&state)?;
            let mut present = HashSet::new();
            let mut endpoints = Vec::new();

            for device in devices.iter() {
                let Ok(desc) = device.device_descriptor() else {
                    continue;
                };
                let (vendor, product) = (desc.vendor_id(), desc.product_id());
                if !filters.iter().any(|f| f.matches(vendor, product)) {
                    continue;
                }

                let key = (device.bus_number(), device.address());
                present.insert(key);
                let id = state.device_id(key);

                if !state.interfaces.contains_key(&id) {
                    match probe_interface(&device, vendor, product) {
                        Ok(Some(interface)) => {
                            debug!(
                                "Device {} ({:04x}:{:04x}) uses interface {}, report ids: {}",
                                id, vendor, product, interface.number, interface.has_report_id
                            );
                            state.interfaces.insert(id, interface);
                        }
                        Ok(None) => {
                            debug!("Device {:04x}:{:04x} has no usable HID interface", vendor, product);
                            continue;
                        }
                        Err(e) => {
                            warn!("Failed to inspect device {:04x}:{:04x}: {}", vendor, product, e);
                            continue;
                        }
                    }
                }

                endpoints.push(Endpoint {
                    path: DevicePath::Hid(id),
                    vendor,
                    product,
                });
            }

            // Ids of unplugged devices are never reused for other devices
            let HidState { ids, interfaces, .. } = &mut *state;
            ids.retain(|key, id| {
                let keep = present.contains(key);
                if !keep {
                    interfaces.remove(id);
                }
                keep
            });

            Ok(endpoints)
        })
        .await
    }

    async fn connect(&self, path: &DevicePath) -> Result<Session> {
        let DevicePath::Hid(id) = *path else {
            return Err(Error::DeviceUnavailable);
        };

        self.blocking(move |context, state| {
            let interface = HidTransport::lock(&state)?
                .interfaces
                .get(&id)
                .copied()
                .ok_or(Error::DeviceUnavailable)?;

            let device = context
                .devices()
                .map_err(map_rusb_error)?
                .iter()
                .find(|d| d.bus_number() == interface.bus && d.address() == interface.address)
                .ok_or(Error::DeviceUnavailable)?;

            let mut handle = device.open().map_err(map_rusb_error)?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("Kernel driver auto-detach unavailable: {}", e);
            }
            handle
                .claim_interface(interface.number)
                .map_err(map_rusb_error)?;

            let mut state = HidTransport::lock(&state)?;
            state.next_session_id += 1;
            let session_id = state.next_session_id;
            state.connections.insert(
                session_id,
                Arc::new(HidConnection {
                    handle,
                    interface,
                    close: CloseHandle::new(),
                }),
            );

            info!("Opened HID device {} as session {}", id, session_id);
            Ok(Session::Hid(session_id))
        })
        .await
    }

    async fn disconnect(&self, session: &Session) -> Result<()> {
        let Session::Hid(id) = *session else {
            return Err(Error::InvalidSession(session.to_string()));
        };

        let connection = Self::lock(&self.state)?
            .connections
            .remove(&id)
            .ok_or_else(|| Error::InvalidSession(id.to_string()))?;

        // Pending reads notice within one poll interval. The interface is
        // released when the handle drops with the last reference below.
        connection.close.close(session, CLOSE_TIMEOUT).await;
        tokio::task::spawn_blocking(move || drop(connection))
            .await
            .map_err(|e| Error::TransferFailed(format!("HID task failed: {}", e)))?;
        debug!("Closed HID session {}", id);
        Ok(())
    }

    async fn send(&self, session: &Session, packet: Packet) -> Result<()> {
        let session = *session;
        self.blocking(move |_, state| {
            let op = HidTransport::lock(&state)?.in_flight(&session)?;
            if op.signal.is_closed() {
                return Err(Error::SessionReleased);
            }
            let connection = &op.connection;

            let mut report = Vec::with_capacity(PACKET_SIZE + 1);
            if packet.report_id != 0 {
                report.push(packet.report_id);
            }
            report.extend_from_slice(&packet.data);

            connection
                .handle
                .write_interrupt(connection.interface.out_endpoint, &report, WRITE_TIMEOUT)
                .map_err(map_rusb_error)?;
            Ok(())
        })
        .await
    }

    async fn receive(&self, session: &Session) -> Result<Packet> {
        let session = *session;
        self.blocking(move |_, state| {
            let op = HidTransport::lock(&state)?.in_flight(&session)?;
            let connection = &op.connection;

            let mut buf = [0u8; PACKET_SIZE + 1];
            let len = loop {
                if op.signal.is_closed() {
                    return Err(Error::SessionReleased);
                }
                match connection.handle.read_interrupt(
                    connection.interface.in_endpoint,
                    &mut buf,
                    READ_POLL_INTERVAL,
                ) {
                    Ok(len) => break len,
                    Err(rusb::Error::Timeout) => continue,
                    Err(e) => return Err(map_rusb_error(e)),
                }
            };

            let data = &buf[..len];
            match data.split_first() {
                Some((report_id, rest)) if connection.interface.has_report_id => Ok(Packet {
                    report_id: *report_id,
                    data: rest.to_vec(),
                }),
                _ => Ok(Packet::raw(data.to_vec())),
            }
        })
        .await
    }

    fn framing(&self, session: &Session) -> Result<Framing> {
        let state = Self::lock(&self.state)?;
        let connection = state.connection(session)?;
        Ok(Framing::for_report_ids(connection.interface.has_report_id))
    }
}
