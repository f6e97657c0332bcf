//! wiimoted
//!
//! A daemon for Linux that drives Wiimotes over hidraw and logs their
//! button and motion events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wiimoted::{
    config::Config,
    hidraw::{list_devices, HidrawTransport, WIIMOTE_PLUS_PID},
    EngineError, MotionEvent, SessionRegistry, SessionSettings, Transport, TransportError,
};

/// Device rescan interval (2 seconds)
const DEVICE_POLL_INTERVAL_SECS: u64 = 2;

/// Capacity of the engine to logger channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// wiimoted - Wiimote motion input daemon
#[derive(Parser, Debug)]
#[command(name = "wiimoted")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/wiimoted/config.json)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List all Wiimotes and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("wiimoted starting...");

    if args.list_devices {
        list_wiimotes();
        return Ok(());
    }

    let loaded = match args.config.as_deref() {
        Some(path) => Config::load(expand_home(path)),
        None => Config::load_default(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };
    let settings = SessionSettings::from(&config);

    let (event_tx, mut event_rx) = mpsc::channel::<MotionEvent>(EVENT_CHANNEL_CAPACITY);
    let shutdown = Arc::new(AtomicBool::new(false));

    // The engine sleeps between device init steps, so it gets its own thread
    let engine_shutdown = shutdown.clone();
    let mut engine_handle = tokio::task::spawn_blocking(move || {
        let registry = SessionRegistry::new(HidrawTransport::new(), settings);
        run_engine(registry, event_tx, engine_shutdown)
    });

    let mut event_handle = tokio::spawn(async move {
        process_motion_events(&mut event_rx).await
    });

    info!("wiimoted ready");

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
            true
        }
        result = &mut engine_handle => {
            if let Err(e) = result {
                error!("Engine task panicked: {:?}", e);
            }
            false
        }
        result = &mut event_handle => {
            if let Err(e) = result {
                error!("Event processing task panicked: {:?}", e);
            }
            false
        }
    };

    if interrupted {
        // Let the engine release its devices before exiting
        shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = engine_handle.await {
            error!("Engine task panicked: {:?}", e);
        }
    }

    Ok(())
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// List all detected Wiimotes
fn list_wiimotes() {
    println!("Scanning for Wiimotes...\n");

    let devices = match list_devices() {
        Ok(devices) => devices,
        Err(TransportError::DeviceNotFound) => Vec::new(),
        Err(e) => {
            println!("Device scan failed: {}", e);
            return;
        }
    };

    if devices.is_empty() {
        println!("No Wiimotes found.");
        println!("\nTroubleshooting:");
        println!("  - Ensure the Wiimote is paired and connected over Bluetooth");
        println!("  - Check that the hid-wiimote driver is not claiming exclusive access");
        println!("  - Check that udev rules grant access to /dev/hidraw*");
        return;
    }

    println!("Found {} Wiimote(s):\n", devices.len());

    for (i, device) in devices.iter().enumerate() {
        let plus_marker = if device.product_id == WIIMOTE_PLUS_PID { " [MotionPlus inside]" } else { "" };
        println!("{}. {}{}", i + 1, device.name.as_deref().unwrap_or("Wiimote"), plus_marker);
        println!("   Path:    {:?}", device.path);
        println!("   Product: 0x{:04X}", device.product_id);
        println!();
    }
}

/// Drive the registry until shutdown is requested or the consumer goes away
///
/// Polls continuously, rescans for new devices every few seconds and
/// forwards every event to the channel.
fn run_engine<T: Transport>(
    mut registry: SessionRegistry<T>,
    event_tx: mpsc::Sender<MotionEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let rescan_interval = Duration::from_secs(DEVICE_POLL_INTERVAL_SECS);
    let idle = Duration::from_millis(1);

    match registry.init() {
        Ok(count) => info!(devices = count, "Motion engine initialized"),
        Err(e) => log_scan_error(&e),
    }
    let mut last_scan = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        if last_scan.elapsed() >= rescan_interval {
            if let Err(e) = registry.rescan() {
                log_scan_error(&e);
            }
            last_scan = Instant::now();
        }

        match registry.poll() {
            Some(event) => {
                if event_tx.blocking_send(event).is_err() {
                    warn!("Event consumer closed, stopping engine");
                    break;
                }
            }
            None => std::thread::sleep(idle),
        }
    }

    registry.shutdown();
}

fn log_scan_error(e: &EngineError) {
    match e {
        EngineError::Transport(TransportError::DeviceNotFound) => {
            debug!(
                "Waiting for Wiimotes... (polling every {}s)",
                DEVICE_POLL_INTERVAL_SECS
            );
        }
        EngineError::Transport(TransportError::PermissionDenied) => {
            error!("Permission denied accessing hidraw devices.");
            error!("Ensure udev rules are installed.");
        }
        e => error!("Device scan failed: {}", e),
    }
}

/// Log events coming from the engine
async fn process_motion_events(event_rx: &mut mpsc::Receiver<MotionEvent>) {
    while let Some(event) = event_rx.recv().await {
        match event {
            MotionEvent::Accel { .. } => debug!("{}", event),
            _ => info!("{}", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiimoted::{Button, ButtonEvent};

    #[test]
    fn test_device_poll_interval() {
        assert_eq!(DEVICE_POLL_INTERVAL_SECS, 2);
    }

    #[test]
    fn test_args_default_config() {
        let args = Args::parse_from(["wiimoted"]);
        assert_eq!(args.config, None);
        assert!(!args.verbose);
        assert!(!args.list_devices);
    }

    #[test]
    fn test_args_config_path() {
        let args = Args::parse_from(["wiimoted", "--config", "~/wii.json"]);
        assert_eq!(args.config.as_deref(), Some("~/wii.json"));
    }

    #[test]
    fn test_args_verbose() {
        let args = Args::parse_from(["wiimoted", "--verbose"]);
        assert!(args.verbose);
    }

    #[test]
    fn test_args_list_devices() {
        let args = Args::parse_from(["wiimoted", "--list-devices"]);
        assert!(args.list_devices);
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/wiimoted.json"), PathBuf::from("/etc/wiimoted.json"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x/config.json"), home.join("x/config.json"));
        }
    }

    #[tokio::test]
    async fn test_motion_event_channel() {
        let (tx, mut rx) = mpsc::channel::<MotionEvent>(8);

        tx.send(MotionEvent::Connected { player: 1 }).await.unwrap();
        tx.send(MotionEvent::Button {
            player: 1,
            event: ButtonEvent::pressed(Button::A),
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await, Some(MotionEvent::Connected { player: 1 }));
        assert!(matches!(
            rx.recv().await,
            Some(MotionEvent::Button { player: 1, event }) if event.button == Button::A && !event.released
        ));
    }

    #[tokio::test]
    async fn test_engine_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(
            HidrawTransport::with_sysfs_dir(dir.path()),
            SessionSettings::default(),
        );
        let (tx, _rx) = mpsc::channel::<MotionEvent>(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(true));

        let handle = tokio::task::spawn_blocking(move || run_engine(registry, tx, shutdown));
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
