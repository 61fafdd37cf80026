//! OCPP Node - CLI charging station
//!
//! Runs the message exchange engine against a CSMS: registers, keeps the
//! heartbeat going and reports connector status. Undelivered messages are
//! kept under `--data-dir` and replayed after a restart.
//!
//! # Usage
//!
//! ```bash
//! # Plain WebSocket, no authentication
//! ocpp-node --station CS001 --csms-url ws://localhost:9000/ocpp
//!
//! # TLS with basic auth (security profile 2)
//! ocpp-node --station CS001 --csms-url wss://csms.example.com/ocpp \
//!     --security-profile 2 --password secret --ca-bundle ./csms_root.pem
//!
//! # Mutual TLS (security profile 3), certificates in ./certs
//! ocpp-node --station CS001 --csms-url wss://csms.example.com/ocpp \
//!     --security-profile 3 --cert-dir ./certs
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_engine::ocpp::{Measurand, RegistrationStatus};
use ocpp_engine::{
    shared, BootReason, ConnectorStatus, Engine, EngineError, FileQueueStore, FileSecurityProvider,
    SecurityProfile, SecurityProvider, Station, StationConfig, Transport,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Wait between BootNotification attempts when the CSMS gives no interval
const BOOT_RETRY: Duration = Duration::from_secs(30);

/// OCPP 2.0.1 charging station node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OCPP station ID
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// CSMS WebSocket URL (station ID is appended)
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    csms_url: String,

    /// Security profile (0 = none, 1 = basic auth, 2 = TLS + basic auth, 3 = mutual TLS)
    #[arg(long, default_value = "0")]
    security_profile: u8,

    /// Basic-auth password (profiles 1 and 2)
    #[arg(long)]
    password: Option<String>,

    /// PEM bundle of CSMS root certificates
    #[arg(long)]
    ca_bundle: Option<PathBuf>,

    /// Directory with cs_cert.pem, cs_key.pem and csms_root.pem
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Directory of the durable message queue
    #[arg(long, default_value = "./ocpp-data")]
    data_dir: PathBuf,

    /// Number of EVSEs
    #[arg(long, default_value = "1")]
    evse_count: u32,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Seconds to wait for a CSMS response
    #[arg(long, default_value = "30")]
    message_timeout: u64,

    /// Transmissions per message before giving up
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Largest CALL the CSMS accepts, in bytes
    #[arg(long, default_value = "65000")]
    max_message_size: usize,

    /// Queue length above which unsent meter reports are dropped
    #[arg(long, default_value = "10000")]
    max_queue_size: usize,

    /// Hold traffic until BootNotification is accepted
    #[arg(long)]
    registration_gate: bool,

    /// Measurands averaged over the flush interval (can be repeated)
    #[arg(long)]
    aligned_measurand: Vec<Measurand>,

    /// Seconds between periodic transaction meter reports
    #[arg(long, default_value = "60")]
    flush_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = SecurityProfile::try_from(args.security_profile)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Node - Charging Station Engine             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:  {:<50} ║", args.station);
    println!("║  CSMS URL: {:<50} ║", truncate(&args.csms_url, 50));
    println!("║  Profile:  {:<50} ║", profile);
    println!("║  Data dir: {:<50} ║", truncate(&args.data_dir.display().to_string(), 50));
    println!("║  EVSEs:    {:<50} ║", args.evse_count);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = StationConfig::new(&args.station, &args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_evse_count(args.evse_count)
        .with_security_profile(profile)
        .with_storage_dir(&args.data_dir)
        .with_retry(Duration::from_secs(args.message_timeout), args.max_attempts)
        .with_max_message_size(args.max_message_size)
        .with_max_queue_size(args.max_queue_size)
        .with_registration_gate(args.registration_gate)
        .with_flush_interval(Duration::from_secs(args.flush_interval));

    if let Some(password) = &args.password {
        config = config.with_basic_auth_password(password);
    }
    if let Some(path) = &args.ca_bundle {
        config = config.with_ca_bundle(path);
    }
    if !args.aligned_measurand.is_empty() {
        config = config.with_aligned_measurands(args.aligned_measurand.iter().copied());
    }

    let security = args.cert_dir.as_ref().map(|dir| {
        info!("Using certificates from {}", dir.display());
        Arc::new(FileSecurityProvider::new(dir)) as Arc<dyn SecurityProvider>
    });

    info!("Opening message store...");
    let store = shared(FileQueueStore::open(config.storage.clone())?);

    let (transport, events) =
        Transport::new(&config.connection, &config.station_id, security)?.spawn();
    let (engine, requests) = Engine::new(&config, store.clone(), transport.clone())?;
    let station = Arc::new(Station::new(config, engine.clone(), store)?);

    let runner = engine.clone();
    let mut engine_task = tokio::spawn(async move { runner.run(events).await });
    tokio::spawn(station.clone().serve_requests(requests));
    let flush_interval = station.config().metering.flush_interval;
    station.transactions().clone().spawn_flush_timer(flush_interval);

    info!("Connecting to CSMS...");
    transport.connect();

    let node = station.clone();
    let mut lifecycle = tokio::spawn(async move { run_station(node).await });

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
        res = &mut engine_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!("Engine task failed: {}", e);
                Ok(())
            }
        },
        res = &mut lifecycle => match res {
            Ok(res) => res,
            Err(e) => {
                error!("Station task failed: {}", e);
                Ok(())
            }
        },
    };

    lifecycle.abort();
    engine.shutdown();
    transport.disconnect();

    if let Err(e) = result {
        error!("Stopped: {}", e);
        return Err(e.into());
    }

    info!("{} messages left for the next run", engine.queue_len());
    Ok(())
}

/// Register, report connectors, then heartbeat forever
async fn run_station(station: Arc<Station>) -> Result<(), EngineError> {
    loop {
        match station.boot_notification(BootReason::PowerUp).await {
            Ok(response) if response.status == RegistrationStatus::Accepted => break,
            Ok(response) => {
                let wait = if response.interval > 0 {
                    Duration::from_secs(response.interval as u64)
                } else {
                    BOOT_RETRY
                };
                warn!("Registration {:?}, retrying in {:?}", response.status, wait);
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("BootNotification failed: {}", e);
                tokio::time::sleep(BOOT_RETRY).await;
            }
        }
    }

    for evse_id in 1..=station.config().evse_count as i32 {
        station.status_notification(evse_id, 1, ConnectorStatus::Available)?;
    }

    info!("Registered, heartbeat every {:?}", station.heartbeat_interval());
    loop {
        tokio::time::sleep(station.heartbeat_interval()).await;
        match station.heartbeat().await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

/// Truncate string with ellipsis, counting characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate("ws://localhost:8180", 50), "ws://localhost:8180");
    }

    #[test]
    fn test_truncate_multibyte_path() {
        let path = "/opt/データ/ステーション/キュー/保存先";
        let truncated = truncate(path, 20);
        assert_eq!(truncated.chars().count(), 20);
        assert!(truncated.ends_with("..."));
        assert!(path.starts_with(truncated.trim_end_matches("...")));
    }
}
