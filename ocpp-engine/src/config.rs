//! Configuration for the charging station engine
//!
//! A snapshot of the device-model variables the engine depends on, grouped by
//! the component that consumes them.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TransportError;
use crate::ocpp::Measurand;
use crate::queue::store::StorageConfig;

/// OCPP security profile (0..=3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityProfile {
    /// Plain WebSocket, no authentication (OCPP 1.6 only, kept for test benches)
    Unsecured = 0,
    /// Plain WebSocket with HTTP basic authentication
    BasicAuth = 1,
    /// TLS with HTTP basic authentication
    TlsBasicAuth = 2,
    /// TLS with client-side certificate
    TlsClientCertificate = 3,
}

impl SecurityProfile {
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            SecurityProfile::TlsBasicAuth | SecurityProfile::TlsClientCertificate
        )
    }

    pub fn uses_basic_auth(self) -> bool {
        matches!(self, SecurityProfile::BasicAuth | SecurityProfile::TlsBasicAuth)
    }
}

impl TryFrom<u8> for SecurityProfile {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityProfile::Unsecured),
            1 => Ok(SecurityProfile::BasicAuth),
            2 => Ok(SecurityProfile::TlsBasicAuth),
            3 => Ok(SecurityProfile::TlsClientCertificate),
            other => Err(TransportError::InvalidProfile(other)),
        }
    }
}

impl std::fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Complete station configuration
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Charging station identity (last path segment of the CSMS url)
    pub station_id: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Serial number (optional)
    pub serial_number: Option<String>,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Number of EVSEs to report
    pub evse_count: u32,

    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    pub metering: MeteringConfig,
    pub storage: StorageConfig,
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Selects plain or TLS channel, fixed for a transport instance
    pub security_profile: SecurityProfile,

    /// Basic-auth password for profiles 1 and 2
    pub basic_auth_password: Option<String>,

    /// PEM bundle of CSMS root certificates (TLS profiles)
    pub ca_bundle: Option<PathBuf>,

    /// Largest WebSocket message accepted from the CSMS
    pub max_incoming_message_size: usize,

    /// Let the engine schedule reconnects after connection loss
    pub auto_reconnect: bool,

    pub reconnect: ReconnectConfig,
}

/// Reconnect backoff (RetryBackOff* device-model variables)
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Minimum wait before the first reconnect attempt
    pub wait_minimum: Duration,

    /// Upper bound of the random jitter added to every wait
    pub random_range: Duration,

    /// How many times the wait doubles before it stays flat
    pub repeat_times: u32,

    /// Hard cap on the wait
    pub max_delay: Duration,
}

/// Message queue and retry settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Time to wait for a CALLRESULT/CALLERROR before retrying
    pub message_timeout: Duration,

    /// Transmissions allowed per message before RetryExhausted
    pub max_attempts: u32,

    /// First retry backoff; doubles per attempt
    pub backoff_base: Duration,

    /// Retry backoff cap
    pub backoff_cap: Duration,

    /// Largest serialized CALL the CSMS accepts; bigger reports are split
    pub max_message_size: usize,

    /// Hold everything except BootNotification until registration is accepted
    pub registration_gate: bool,

    /// Queue length above which unsent meter-value traffic is shed,
    /// oldest first
    pub max_queue_size: usize,
}

/// Meter value aggregation settings
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Measurands reported as averages over the flush interval
    pub aligned_measurands: BTreeSet<Measurand>,

    /// Interval of TransactionEvent(Updated) meter reports
    pub flush_interval: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: "EK3-001".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            model: "EK3-OCPP".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            evse_count: 1,
            connection: ConnectionConfig::default(),
            queue: QueueConfig::default(),
            metering: MeteringConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            security_profile: SecurityProfile::Unsecured,
            basic_auth_password: None,
            ca_bundle: None,
            max_incoming_message_size: 64 * 1024,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            wait_minimum: Duration::from_secs(5),
            random_range: Duration::from_secs(2),
            repeat_times: 5,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
            max_message_size: 65_000,
            registration_gate: false,
            max_queue_size: 10_000,
        }
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            aligned_measurands: [
                Measurand::CurrentImport,
                Measurand::Voltage,
                Measurand::PowerActiveImport,
                Measurand::Frequency,
            ]
            .into_iter()
            .collect(),
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl StationConfig {
    /// Create config with basic parameters
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            connection: ConnectionConfig {
                csms_url: csms_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    /// Set EVSE count
    pub fn with_evse_count(mut self, count: u32) -> Self {
        self.evse_count = count;
        self
    }

    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.connection.security_profile = profile;
        self
    }

    pub fn with_basic_auth_password(mut self, password: impl Into<String>) -> Self {
        self.connection.basic_auth_password = Some(password.into());
        self
    }

    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection.ca_bundle = Some(path.into());
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.dir = dir.into();
        self
    }

    /// Set message timeout and retry limits
    pub fn with_retry(mut self, timeout: Duration, max_attempts: u32) -> Self {
        self.queue.message_timeout = timeout;
        self.queue.max_attempts = max_attempts;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.queue.max_message_size = bytes;
        self
    }

    pub fn with_registration_gate(mut self, enabled: bool) -> Self {
        self.queue.registration_gate = enabled;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.queue.max_queue_size = size;
        self
    }

    pub fn with_aligned_measurands(mut self, measurands: impl IntoIterator<Item = Measurand>) -> Self {
        self.metering.aligned_measurands = measurands.into_iter().collect();
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.metering.flush_interval = interval;
        self
    }
}
