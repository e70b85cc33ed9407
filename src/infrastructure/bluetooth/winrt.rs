//! WinRT Backend
//!
//! `RadioScanner` and `GattTransport` over `Windows.Devices.Bluetooth`.
//! WinRT async calls run on spawned tokio tasks and report back through the
//! session's event sender.

use crate::domain::error::{BandError, Result};
use crate::domain::models::{CharacteristicRef, PeripheralHandle, RawNotification};
use crate::infrastructure::bluetooth::protocol::CCCD_UUID;
use crate::infrastructure::bluetooth::transport::{
    Advertisement, DiscoveredCharacteristic, DiscoveredService, GattEvent, GattEventSender,
    GattTransport, RadioScanner,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStatus, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};
use windows::Win32::Foundation::{E_ACCESSDENIED, E_FAIL};

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

/// Format a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_address(address: &str) -> Result<u64> {
    let hex = address.replace(':', "");
    if hex.len() != 12 {
        return Err(BandError::LinkFailure(format!(
            "invalid Bluetooth address: {}",
            address
        )));
    }
    u64::from_str_radix(&hex, 16)
        .map_err(|e| BandError::LinkFailure(format!("invalid Bluetooth address {}: {}", address, e)))
}

fn status_name(status: GattCommunicationStatus) -> &'static str {
    match status {
        GattCommunicationStatus::Success => "Success",
        GattCommunicationStatus::Unreachable => "Unreachable",
        GattCommunicationStatus::ProtocolError => "ProtocolError",
        GattCommunicationStatus::AccessDenied => "AccessDenied",
        _ => "an unknown status",
    }
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn transport_error(e: windows::core::Error) -> BandError {
    if e.code() == E_ACCESSDENIED {
        BandError::PermissionDenied(e.message().to_string())
    } else {
        BandError::Transport(e.message().to_string())
    }
}

/// Advertisement watcher
#[derive(Default)]
pub struct WinRtScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl WinRtScanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_watcher(
        &mut self,
        sightings: mpsc::UnboundedSender<Advertisement>,
    ) -> windows::core::Result<BluetoothLEAdvertisementWatcher> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let _ = sightings.send(Advertisement {
                        address: format_address(args.BluetoothAddress()?),
                        name: if name.is_empty() { None } else { Some(name) },
                        rssi: args.RawSignalStrengthInDBm().ok(),
                    });
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        Ok(watcher)
    }
}

impl RadioScanner for WinRtScanner {
    fn start(&mut self, sightings: mpsc::UnboundedSender<Advertisement>) -> Result<()> {
        self.stop();

        let watcher = self.start_watcher(sightings).map_err(transport_error)?;
        if watcher.Status().map_err(transport_error)? == BluetoothLEAdvertisementWatcherStatus::Aborted {
            return Err(BandError::PermissionDenied(
                "advertisement watcher aborted; Bluetooth may be off or blocked".into(),
            ));
        }

        info!("WinRT advertisement watcher started");
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }

    fn is_scanning(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for WinRtScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything held for one open link
struct Link {
    device: BluetoothLEDevice,
    status_token: i64,
    services: Vec<GattDeviceService>,
    characteristics: HashMap<CharacteristicRef, GattCharacteristic>,
    value_tokens: Vec<(GattCharacteristic, i64)>,
}

impl Link {
    fn close(self) {
        for (characteristic, token) in self.value_tokens {
            let _ = characteristic.RemoveValueChanged(token);
        }
        for service in self.services {
            let _ = service.Close();
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        let _ = self.device.Close();
    }
}

type SharedLink = Arc<Mutex<Option<Link>>>;

#[derive(Default)]
pub struct WinRtTransport {
    link: SharedLink,
    events: Option<GattEventSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> Result<GattEventSender> {
        self.events
            .clone()
            .ok_or_else(|| BandError::Transport("not connected".into()))
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn characteristic(&self, target: &CharacteristicRef) -> Result<GattCharacteristic> {
        let link = self
            .link
            .lock()
            .map_err(|_| BandError::Transport("link lock poisoned".into()))?;
        link.as_ref()
            .and_then(|l| l.characteristics.get(target).cloned())
            .ok_or_else(|| BandError::CharacteristicNotFound(target.to_string()))
    }
}

async fn open_device(
    address: u64,
    link: SharedLink,
    events: GattEventSender,
) -> windows::core::Result<()> {
    let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
    info!("Device opened: {:?}", device.Name()?);

    let sender = events.clone();
    let status_handler = TypedEventHandler::new(
        move |dev: windows::core::Ref<BluetoothLEDevice>,
              _: windows::core::Ref<windows::core::IInspectable>| {
            if let Some(dev) = dev.as_ref() {
                if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                    sender.send(GattEvent::LinkDropped(None));
                }
            }
            Ok(())
        },
    );
    let status_token = device.ConnectionStatusChanged(&status_handler)?;

    if let Ok(mut slot) = link.lock() {
        *slot = Some(Link {
            device,
            status_token,
            services: Vec::new(),
            characteristics: HashMap::new(),
            value_tokens: Vec::new(),
        });
    }
    events.send(GattEvent::LinkEstablished);
    Ok(())
}

async fn discover(link: SharedLink) -> windows::core::Result<Vec<DiscoveredService>> {
    let device = match link.lock().ok().and_then(|l| l.as_ref().map(|l| l.device.clone())) {
        Some(device) => device,
        None => return Ok(Vec::new()),
    };

    // Uncached to avoid stale handles after firmware changes
    let services_result = device
        .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    let status = services_result.Status()?;
    if status != GattCommunicationStatus::Success {
        return Err(windows::core::Error::new(
            E_FAIL,
            format!("GATT service query returned {}", status_name(status)),
        ));
    }

    let services = services_result.Services()?;
    let mut discovered = Vec::new();
    let mut handles = Vec::new();
    let mut characteristics = HashMap::new();

    for i in 0..services.Size()? {
        let service = services.GetAt(i)?;
        let service_uuid = to_uuid(service.Uuid()?);

        let chars_result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let mut found = Vec::new();
        if chars_result.Status()? == GattCommunicationStatus::Success {
            let chars = chars_result.Characteristics()?;
            for j in 0..chars.Size()? {
                let c = chars.GetAt(j)?;
                let uuid = to_uuid(c.Uuid()?);
                let props = c.CharacteristicProperties()?;
                // WinRT writes the CCCD itself; expose it when notify is supported
                let notifies = (props & GattCharacteristicProperties::Notify)
                    == GattCharacteristicProperties::Notify;
                found.push(DiscoveredCharacteristic {
                    uuid,
                    descriptors: if notifies { vec![CCCD_UUID] } else { Vec::new() },
                });
                characteristics.insert(
                    CharacteristicRef {
                        service: service_uuid,
                        characteristic: uuid,
                    },
                    c,
                );
            }
        } else {
            debug!("Characteristics of {} unavailable", service_uuid);
        }

        discovered.push(DiscoveredService {
            uuid: service_uuid,
            characteristics: found,
        });
        handles.push(service);
    }

    if let Ok(mut slot) = link.lock() {
        if let Some(link) = slot.as_mut() {
            link.services = handles;
            link.characteristics = characteristics;
        }
    }
    Ok(discovered)
}

impl GattTransport for WinRtTransport {
    fn connect(&mut self, peripheral: &PeripheralHandle, events: GattEventSender) -> Result<()> {
        self.disconnect();
        let address = parse_address(&peripheral.address)?;
        self.events = Some(events.clone());

        info!("Connecting to Bluetooth device: {:#X}", address);
        let link = Arc::clone(&self.link);
        self.spawn(async move {
            if let Err(e) = open_device(address, link, events.clone()).await {
                events.send(GattEvent::LinkFailed(e.message().to_string()));
            }
        });
        Ok(())
    }

    fn discover_services(&mut self) -> Result<()> {
        let events = self.events()?;
        let link = Arc::clone(&self.link);
        self.spawn(async move {
            match discover(link).await {
                Ok(services) => events.send(GattEvent::ServicesDiscovered(services)),
                Err(e) => events.send(GattEvent::DiscoveryFailed(e.message().to_string())),
            };
        });
        Ok(())
    }

    fn write_without_response(&mut self, target: &CharacteristicRef, value: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(target)?;
        let writer = DataWriter::new().map_err(transport_error)?;
        writer.WriteBytes(value).map_err(transport_error)?;
        let buffer = writer.DetachBuffer().map_err(transport_error)?;

        // Fire-and-forget write
        let _ = characteristic
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)
            .map_err(transport_error)?;
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        target: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        if descriptor != CCCD_UUID {
            return Err(BandError::Transport(format!(
                "only the CCCD can be written, not {}",
                descriptor
            )));
        }
        let cccd = match value {
            [0x01, 0x00] => GattClientCharacteristicConfigurationDescriptorValue::Notify,
            [0x02, 0x00] => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
            _ => GattClientCharacteristicConfigurationDescriptorValue::None,
        };

        let characteristic = self.characteristic(target)?;
        let events = self.events()?;

        // Register before enabling so the first notification is not missed
        let source = *target;
        let sender = events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let payload = read_buffer(&args.CharacteristicValue()?)?;
                    sender.send(GattEvent::Notification(RawNotification {
                        source,
                        payload,
                        received_at: Instant::now(),
                    }));
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler).map_err(transport_error)?;
        if let Ok(mut slot) = self.link.lock() {
            if let Some(link) = slot.as_mut() {
                link.value_tokens.push((characteristic.clone(), token));
            }
        }

        self.spawn(async move {
            let success = match characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(cccd) {
                Ok(op) => match op.await {
                    Ok(status) => status == GattCommunicationStatus::Success,
                    Err(e) => {
                        warn!("CCCD write on {} failed: {}", source, e);
                        false
                    }
                },
                Err(e) => {
                    warn!("CCCD write on {} rejected: {}", source, e);
                    false
                }
            };
            events.send(GattEvent::DescriptorWritten {
                characteristic: source,
                success,
            });
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let link = self.link.lock().ok().and_then(|mut l| l.take());
        if let Some(link) = link {
            info!("Closing GATT link");
            link.close();
        }
        self.events = None;
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let address = 0xC47C_8D6A_1102;
        assert_eq!(format_address(address), "C4:7C:8D:6A:11:02");
        assert_eq!(parse_address("C4:7C:8D:6A:11:02").unwrap(), address);
    }

    #[test]
    fn test_invalid_address() {
        assert!(parse_address("C4:7C").is_err());
        assert!(parse_address("ZZ:7C:8D:6A:11:02").is_err());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(GattCommunicationStatus::Unreachable), "Unreachable");
        assert_eq!(status_name(GattCommunicationStatus::AccessDenied), "AccessDenied");
    }

    #[test]
    fn test_guid_conversion() {
        let guid = GUID::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
        assert_eq!(
            to_uuid(guid),
            crate::infrastructure::bluetooth::protocol::HEART_RATE_SERVICE_UUID
        );
    }
}
