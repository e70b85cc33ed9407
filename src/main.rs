use anyhow::Context;
use beatxp_connect::domain::events::ChannelSink;
use beatxp_connect::domain::models::{AppEvent, ConnectionState, PeripheralHandle};
use beatxp_connect::domain::settings::{Settings, SettingsService};
use beatxp_connect::infrastructure::bluetooth::transport::{GattTransport, RadioScanner};
use beatxp_connect::infrastructure::bluetooth::BandService;
use beatxp_connect::infrastructure::logging;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pick the band to connect to from what the scan found
///
/// Prefers the last connected address, then a name matching the configured
/// prefix, then the first sighting.
fn choose_peripheral(found: &[PeripheralHandle], settings: &Settings) -> Option<PeripheralHandle> {
    let remembered = settings
        .last_connected_address
        .as_ref()
        .and_then(|address| found.iter().find(|p| &p.address == address));
    let by_prefix = || {
        settings.target_name_prefix.as_ref().and_then(|prefix| {
            found
                .iter()
                .find(|p| p.name.as_deref().is_some_and(|n| n.starts_with(prefix.as_str())))
        })
    };

    remembered
        .or_else(by_prefix)
        .or_else(|| found.first())
        .cloned()
}

async fn run<R, T>(radio: R, transport: T, mut settings: SettingsService) -> anyhow::Result<()>
where
    R: RadioScanner,
    T: GattTransport + 'static,
{
    let (sink, mut events) = ChannelSink::channel();
    let mut service = BandService::start(radio, transport, Arc::new(sink), settings.get());

    info!("Scanning for {} ms", settings.get().scan_timeout_ms);
    let mut scan = service.start_scan()?;
    while let Some(peripheral) = scan.next().await {
        info!("Found {}", peripheral);
    }
    let found = scan.discovered().to_vec();
    drop(scan);

    let Some(band) = choose_peripheral(&found, settings.get()) else {
        warn!("No band found");
        service.shutdown().await;
        return Ok(());
    };

    info!("Connecting to {}", band);
    service.connect(band.clone())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    AppEvent::ConnectionState(state) => {
                        info!("Connection state: {}", state);
                        match state {
                            ConnectionState::Ready => {
                                if let Err(e) = settings.record_connection(&band.address) {
                                    warn!("Failed to save settings: {}", e);
                                }
                            }
                            ConnectionState::Failed(_) | ConnectionState::Disconnected => break,
                            _ => {}
                        }
                    }
                    AppEvent::Steps(m) => match (m.distance_meters(), m.calories()) {
                        (Some(distance), Some(calories)) => info!(
                            "Steps: {} ({} m, {} kcal)",
                            m.steps(),
                            distance,
                            calories
                        ),
                        _ => info!("Steps: {}", m.steps()),
                    },
                    AppEvent::HeartRate(hr) => info!("Heart rate: {} bpm", hr.bpm),
                    AppEvent::Error { kind, context } => error!("{}: {}", kind, context),
                    AppEvent::PeripheralsUpdated(_) => {}
                }
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

#[cfg(windows)]
async fn run_radio(settings: SettingsService) -> anyhow::Result<()> {
    use beatxp_connect::infrastructure::bluetooth::winrt::{WinRtScanner, WinRtTransport};
    run(WinRtScanner::new(), WinRtTransport::new(), settings).await
}

#[cfg(not(windows))]
async fn run_radio(_settings: SettingsService) -> anyhow::Result<()> {
    anyhow::bail!("No BLE backend on this platform; run with --simulate")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new().context("Failed to load settings")?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting BeatXP Connect");
    info!("Settings: {}", settings.path().display());

    let simulate = settings.get().simulate || std::env::args().any(|a| a == "--simulate");
    if simulate {
        use beatxp_connect::infrastructure::bluetooth::simulator::{
            SimulatedRadio, SimulatedTransport, SimulatorConfig,
        };
        info!("Using the simulated band");
        let config = SimulatorConfig::default();
        run(
            SimulatedRadio::new(config.clone()),
            SimulatedTransport::new(config),
            settings,
        )
        .await
    } else {
        run_radio(settings).await
    }
}
