//! Platform seam
//!
//! The BLE stack is driven through fire-and-forget requests; results come
//! back later as [`GattEvent`]s on the session's input queue.

use crate::domain::error::Result;
use crate::domain::models::{CharacteristicRef, PeripheralHandle, RawNotification};
use crate::infrastructure::bluetooth::session::SessionInput;
use crate::infrastructure::scheduler::Epoch;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One advertisement sighting, before filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Radio side of device discovery
pub trait RadioScanner: Send {
    /// Begin delivering sightings. Must fail synchronously when the platform
    /// refuses to scan.
    fn start(&mut self, sightings: mpsc::UnboundedSender<Advertisement>) -> Result<()>;

    /// Stop the radio. Calling it while stopped is a no-op.
    fn stop(&mut self);

    fn is_scanning(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Result of looking a characteristic up in the discovered table
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
    ServiceMissing,
    CharacteristicMissing,
    Found(&'a DiscoveredCharacteristic),
}

/// Find `target` among discovered services
pub fn lookup<'a>(services: &'a [DiscoveredService], target: &CharacteristicRef) -> Lookup<'a> {
    let Some(service) = services.iter().find(|s| s.uuid == target.service) else {
        return Lookup::ServiceMissing;
    };

    service
        .characteristics
        .iter()
        .find(|c| c.uuid == target.characteristic)
        .map_or(Lookup::CharacteristicMissing, Lookup::Found)
}

/// Callbacks from the BLE stack for one link
#[derive(Debug, Clone)]
pub enum GattEvent {
    LinkEstablished,
    LinkFailed(String),
    ServicesDiscovered(Vec<DiscoveredService>),
    DiscoveryFailed(String),
    DescriptorWritten {
        characteristic: CharacteristicRef,
        success: bool,
    },
    Notification(RawNotification),
    LinkDropped(Option<String>),
}

/// Handle the transport uses to report events for one link
///
/// Every event is stamped with the epoch of the connect request that
/// created the sender, so callbacks from a torn-down link are dropped.
#[derive(Debug, Clone)]
pub struct GattEventSender {
    epoch: Epoch,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl GattEventSender {
    pub fn new(epoch: Epoch, inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { epoch, inputs }
    }

    /// Returns false once the session loop has gone away
    pub fn send(&self, event: GattEvent) -> bool {
        self.inputs
            .send(SessionInput::Gatt {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// GATT client side of one link
///
/// Only one request is ever outstanding; the session waits for the
/// corresponding event (or its own timeout) before issuing the next.
pub trait GattTransport: Send {
    /// Open a link; reports `LinkEstablished` or `LinkFailed`
    fn connect(&mut self, peripheral: &PeripheralHandle, events: GattEventSender) -> Result<()>;

    /// Reports `ServicesDiscovered` or `DiscoveryFailed`
    fn discover_services(&mut self) -> Result<()>;

    /// Write without response; there is no completion event
    fn write_without_response(&mut self, target: &CharacteristicRef, value: &[u8]) -> Result<()>;

    /// Reports `DescriptorWritten`
    fn write_descriptor(
        &mut self,
        target: &CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Release every resource of the current link. Idempotent.
    fn disconnect(&mut self);
}
