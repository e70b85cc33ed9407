//! BLE Scanner Module
//!
//! Turns raw advertisement sightings into a deduplicated, ordered stream of
//! named peripherals for one bounded scan window.

use crate::domain::error::{BandError, Result};
use crate::domain::events::EventSink;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::{Advertisement, RadioScanner};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scan front-end over a platform radio
pub struct ScanGate<R: RadioScanner> {
    radio: Arc<Mutex<RadioSlot<R>>>,
    sink: Option<Arc<dyn EventSink>>,
    name_prefix: Option<String>,
    stop_signal: Option<watch::Sender<bool>>,
}

impl<R: RadioScanner> ScanGate<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio: Arc::new(Mutex::new(RadioSlot { radio, scan_id: 0 })),
            sink: None,
            name_prefix: None,
            stop_signal: None,
        }
    }

    /// Report the growing peripheral list to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Only yield peripherals whose name starts with `prefix`
    pub fn with_name_prefix(mut self, prefix: Option<String>) -> Self {
        self.name_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    /// Start a scan that stops by itself after `timeout`
    ///
    /// Any scan already running is stopped first. Permission problems are
    /// reported here, never mid-stream.
    pub fn start_scan(&mut self, timeout: Duration) -> Result<ScanStream<R>> {
        if timeout.is_zero() {
            return Err(BandError::InvalidScanTimeout);
        }

        self.stop_scan();

        let (tx, rx) = mpsc::unbounded_channel();
        let scan_id = {
            let mut slot = self
                .radio
                .lock()
                .map_err(|_| BandError::Transport("scanner lock poisoned".into()))?;
            slot.radio.start(tx)?;
            slot.scan_id += 1;
            slot.scan_id
        };
        info!("BLE scan started for {:?}", timeout);

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_signal = Some(stop_tx);

        Ok(ScanStream {
            sightings: rx,
            stop: stop_rx,
            deadline: Instant::now() + timeout,
            seen: HashSet::new(),
            discovered: Vec::new(),
            name_prefix: self.name_prefix.clone(),
            sink: self.sink.clone(),
            guard: RadioGuard {
                radio: Arc::clone(&self.radio),
                scan_id,
            },
            finished: false,
        })
    }

    /// Stop the current scan, if any
    pub fn stop_scan(&mut self) {
        if let Some(stop) = self.stop_signal.take() {
            info!("Stopping BLE scan...");
            let _ = stop.send(true);
        }
        stop_radio(&self.radio, None);
    }

    pub fn is_scanning(&self) -> bool {
        self.radio
            .lock()
            .map(|slot| slot.radio.is_scanning())
            .unwrap_or(false)
    }
}

impl<R: RadioScanner> Drop for ScanGate<R> {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

/// The radio plus the id of the scan currently holding it
struct RadioSlot<R: RadioScanner> {
    radio: R,
    scan_id: u64,
}

/// Stop the radio; with `Some(id)`, only if that scan still owns it
fn stop_radio<R: RadioScanner>(slot: &Mutex<RadioSlot<R>>, scan_id: Option<u64>) {
    match slot.lock() {
        Ok(mut slot) => {
            if scan_id.map_or(true, |id| id == slot.scan_id) {
                slot.radio.stop();
            }
        }
        Err(_) => warn!("Scanner lock poisoned, radio may still be scanning"),
    }
}

/// Stops the radio when the stream goes away
struct RadioGuard<R: RadioScanner> {
    radio: Arc<Mutex<RadioSlot<R>>>,
    scan_id: u64,
}

impl<R: RadioScanner> RadioGuard<R> {
    fn release(&self) {
        stop_radio(&self.radio, Some(self.scan_id));
    }
}

impl<R: RadioScanner> Drop for RadioGuard<R> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Peripherals found during one scan, each yielded once in first-seen order
pub struct ScanStream<R: RadioScanner> {
    sightings: mpsc::UnboundedReceiver<Advertisement>,
    stop: watch::Receiver<bool>,
    deadline: Instant,
    seen: HashSet<String>,
    discovered: Vec<PeripheralHandle>,
    name_prefix: Option<String>,
    sink: Option<Arc<dyn EventSink>>,
    guard: RadioGuard<R>,
    finished: bool,
}

impl<R: RadioScanner> ScanStream<R> {
    /// Next new peripheral, or `None` once the scan has ended
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        while !self.finished {
            tokio::select! {
                biased;

                _ = self.stop.changed() => {
                    debug!("Scan stopped by request");
                    self.finish();
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    info!("Scan window elapsed, {} peripherals found", self.discovered.len());
                    self.finish();
                }
                sighting = self.sightings.recv() => match sighting {
                    Some(advertisement) => {
                        if let Some(peripheral) = self.accept(advertisement) {
                            return Some(peripheral);
                        }
                    }
                    None => {
                        debug!("Radio closed the sighting channel");
                        self.finish();
                    }
                },
            }
        }
        None
    }

    /// Run the scan to completion and return everything found
    pub async fn collect(mut self) -> Vec<PeripheralHandle> {
        while self.next().await.is_some() {}
        std::mem::take(&mut self.discovered)
    }

    /// Peripherals yielded so far
    pub fn discovered(&self) -> &[PeripheralHandle] {
        &self.discovered
    }

    fn accept(&mut self, advertisement: Advertisement) -> Option<PeripheralHandle> {
        let name = advertisement.name.filter(|n| !n.trim().is_empty())?;

        if let Some(prefix) = &self.name_prefix {
            if !name.starts_with(prefix.as_str()) {
                return None;
            }
        }

        if !self.seen.insert(advertisement.address.clone()) {
            return None;
        }

        let peripheral = PeripheralHandle::new(advertisement.address, Some(name));
        debug!(
            "Found peripheral {} (rssi {:?})",
            peripheral, advertisement.rssi
        );
        self.discovered.push(peripheral.clone());
        if let Some(sink) = &self.sink {
            sink.on_peripherals_updated(&self.discovered);
        }
        Some(peripheral)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.sightings.close();
        self.guard.release();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::events::ChannelSink;
    use crate::domain::models::AppEvent;

    /// Radio whose sightings are pushed by the test
    #[derive(Clone, Default)]
    pub(crate) struct FakeRadio {
        pub sender: Arc<Mutex<Option<mpsc::UnboundedSender<Advertisement>>>>,
        pub starts: Arc<Mutex<usize>>,
        pub deny: bool,
    }

    impl FakeRadio {
        pub fn sight(&self, address: &str, name: Option<&str>) {
            if let Some(tx) = self.sender.lock().unwrap().as_ref() {
                let _ = tx.send(Advertisement {
                    address: address.to_string(),
                    name: name.map(str::to_string),
                    rssi: Some(-60),
                });
            }
        }

        pub fn scanning(&self) -> bool {
            self.sender.lock().unwrap().is_some()
        }
    }

    impl RadioScanner for FakeRadio {
        fn start(&mut self, sightings: mpsc::UnboundedSender<Advertisement>) -> Result<()> {
            if self.deny {
                return Err(BandError::PermissionDenied("BLUETOOTH_SCAN not granted".into()));
            }
            *self.starts.lock().unwrap() += 1;
            *self.sender.lock().unwrap() = Some(sightings);
            Ok(())
        }

        fn stop(&mut self) {
            self.sender.lock().unwrap().take();
        }

        fn is_scanning(&self) -> bool {
            self.scanning()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_yield_once_in_order() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let mut scan = gate.start_scan(Duration::from_secs(10)).unwrap();

        radio.sight("AA", Some("Band A"));
        radio.sight("AA", Some("Band A"));
        radio.sight("BB", Some("Band B"));

        assert_eq!(scan.next().await.unwrap().address, "AA");
        assert_eq!(scan.next().await.unwrap().address, "BB");
        assert_eq!(scan.next().await, None);
        assert!(!radio.scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unnamed_peripherals_are_excluded() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let scan = gate.start_scan(Duration::from_secs(1)).unwrap();

        radio.sight("AA", None);
        radio.sight("BB", Some(""));
        radio.sight("CC", Some("Band C"));
        // A later named sighting of an unnamed address still counts
        radio.sight("AA", Some("Band A"));

        let found: Vec<_> = scan.collect().await.into_iter().map(|p| p.address).collect();
        assert_eq!(found, vec!["CC", "AA"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_radio() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let mut scan = gate.start_scan(Duration::from_millis(500)).unwrap();
        assert!(gate.is_scanning());

        let started = Instant::now();
        assert_eq!(scan.next().await, None);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!gate.is_scanning());

        // Sightings after the window are not delivered
        radio.sight("AA", Some("Late"));
        assert_eq!(scan.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_ends_stream() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let mut scan = gate.start_scan(Duration::from_secs(60)).unwrap();

        radio.sight("AA", Some("Band A"));
        assert!(scan.next().await.is_some());

        gate.stop_scan();
        assert_eq!(scan.next().await, None);
        assert!(!radio.scanning());
        assert_eq!(scan.discovered().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_radio() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let scan = gate.start_scan(Duration::from_secs(60)).unwrap();
        assert!(radio.scanning());

        drop(scan);
        assert!(!radio.scanning());
    }

    #[tokio::test]
    async fn test_restart_stops_previous_scan() {
        let radio = FakeRadio::default();
        let mut gate = ScanGate::new(radio.clone());
        let mut first = gate.start_scan(Duration::from_secs(60)).unwrap();
        let _second = gate.start_scan(Duration::from_secs(60)).unwrap();

        assert_eq!(*radio.starts.lock().unwrap(), 2);
        assert_eq!(first.next().await, None);
        drop(first);
        // The superseded stream must not stop the new scan
        assert!(radio.scanning());
    }

    #[test]
    fn test_permission_denied_is_synchronous() {
        let radio = FakeRadio {
            deny: true,
            ..Default::default()
        };
        let mut gate = ScanGate::new(radio);
        let err = gate.start_scan(Duration::from_secs(5)).err().unwrap();
        assert!(matches!(err, BandError::PermissionDenied(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut gate = ScanGate::new(FakeRadio::default());
        assert!(matches!(
            gate.start_scan(Duration::ZERO),
            Err(BandError::InvalidScanTimeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_prefix_and_sink_updates() {
        let radio = FakeRadio::default();
        let (sink, mut events) = ChannelSink::channel();
        let mut gate = ScanGate::new(radio.clone())
            .with_sink(Arc::new(sink))
            .with_name_prefix(Some("BeatXP".into()));
        let scan = gate.start_scan(Duration::from_secs(1)).unwrap();

        radio.sight("AA", Some("Mi Band"));
        radio.sight("BB", Some("BeatXP Vega"));
        radio.sight("CC", Some("BeatXP Marv"));
        let found = scan.collect().await;
        assert_eq!(found.len(), 2);

        let updates: Vec<usize> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| match e {
                AppEvent::PeripheralsUpdated(list) => list.len(),
                other => panic!("unexpected event: {:?}", other),
            })
            .collect();
        assert_eq!(updates, vec![1, 2]);
    }
}
