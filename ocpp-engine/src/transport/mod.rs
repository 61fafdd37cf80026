//! WebSocket transport to the CSMS
//!
//! The channel variant (plain or TLS) is chosen once from the security profile
//! when the transport is built. The transport never retries on its own: the
//! engine drives it through a command stream and learns about connection
//! changes and inbound frames through an event stream.
//!
//! ```text
//!   Engine --TransportCommand--> driver task --frames--> CSMS
//!   Engine <--TransportEvent---- driver task <--frames-- CSMS
//! ```

pub mod security;

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Error as WsError, Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, SecurityProfile};
use crate::error::{ConnectError, TransportError};
use security::{tls_connector, SecurityProvider};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifications from the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected {
        reason: String,
        /// Closed on request rather than lost
        requested: bool,
    },
    /// Inbound text frame
    Message(String),
    ConnectFailed(TransportError),
    /// Profile 3 channel cannot open until a client certificate is installed
    CertificateSignRequested,
}

/// Requests to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Connect,
    Disconnect,
    /// Drop the current connection (if any) and connect again after `delay`
    Reconnect { reason: String, delay: Duration },
    Send(String),
}

/// Cloneable command side of a transport
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    /// Handle plus the raw command stream, for driving a transport by hand
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    pub fn connect(&self) -> bool {
        self.commands.send(TransportCommand::Connect).is_ok()
    }

    pub fn disconnect(&self) -> bool {
        self.commands.send(TransportCommand::Disconnect).is_ok()
    }

    pub fn reconnect(&self, reason: impl Into<String>, delay: Duration) -> bool {
        self.commands
            .send(TransportCommand::Reconnect {
                reason: reason.into(),
                delay,
            })
            .is_ok()
    }

    /// Queue a text frame; false when the transport task is gone
    pub fn send(&self, frame: String) -> bool {
        self.commands.send(TransportCommand::Send(frame)).is_ok()
    }
}

/// Resolved CSMS endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// `Authorization` header value for basic-auth profiles
    pub authorization: Option<String>,
}

/// Build the full OCPP WebSocket URL.
///
/// The scheme follows the security profile (`ws` for 0/1, `wss` for 2/3) and
/// the station id becomes the last path segment.
pub fn build_ocpp_url(
    base_url: &str,
    station_id: &str,
    profile: SecurityProfile,
) -> Result<String, TransportError> {
    let rest = match base_url.split_once("://") {
        Some(("ws" | "wss" | "http" | "https", rest)) => rest,
        Some((scheme, _)) => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                scheme, base_url
            )))
        }
        None => base_url,
    };
    if rest.is_empty() {
        return Err(TransportError::InvalidUrl(base_url.to_string()));
    }

    let scheme = if profile.is_tls() { "wss" } else { "ws" };
    Ok(format!(
        "{}://{}/{}",
        scheme,
        rest.trim_end_matches('/'),
        station_id
    ))
}

/// `Basic base64(station_id:password)`
pub fn basic_auth_header(station_id: &str, password: &str) -> String {
    let credentials = format!("{}:{}", station_id, password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(credentials)
    )
}

impl Endpoint {
    pub fn from_config(config: &ConnectionConfig, station_id: &str) -> Result<Self, TransportError> {
        let profile = config.security_profile;
        let url = build_ocpp_url(&config.csms_url, station_id, profile)?;

        let authorization = if profile.uses_basic_auth() {
            let password = config
                .basic_auth_password
                .as_deref()
                .ok_or(TransportError::MissingPassword(profile as u8))?;
            Some(basic_auth_header(station_id, password))
        } else {
            None
        };

        Ok(Self { url, authorization })
    }
}

/// Plain WebSocket channel (profiles 0 and 1)
pub struct PlainTransport {
    endpoint: Endpoint,
    ws_config: WebSocketConfig,
}

/// TLS WebSocket channel (profiles 2 and 3)
pub struct TlsTransport {
    endpoint: Endpoint,
    ws_config: WebSocketConfig,
    ca_bundle: Option<Vec<u8>>,
    client_certificate: bool,
    security: Option<Arc<dyn SecurityProvider>>,
}

/// Transport variant selected from the security profile
pub enum Transport {
    Plain(PlainTransport),
    Tls(TlsTransport),
}

impl Transport {
    /// Build the transport for `config.security_profile`. The variant cannot
    /// change afterwards; a new profile needs a new transport.
    pub fn new(
        config: &ConnectionConfig,
        station_id: &str,
        security: Option<Arc<dyn SecurityProvider>>,
    ) -> Result<Self, TransportError> {
        let endpoint = Endpoint::from_config(config, station_id)?;
        let ws_config = WebSocketConfig {
            max_message_size: Some(config.max_incoming_message_size),
            max_frame_size: Some(config.max_incoming_message_size),
            ..Default::default()
        };

        let transport = if config.security_profile.is_tls() {
            let ca_bundle = match &config.ca_bundle {
                Some(path) => Some(std::fs::read(path).map_err(|e| {
                    TransportError::TlsConfig(format!("cannot read {:?}: {}", path, e))
                })?),
                None => None,
            };
            let client_certificate =
                config.security_profile == SecurityProfile::TlsClientCertificate;
            if client_certificate && security.is_none() {
                return Err(TransportError::TlsConfig(
                    "profile 3 requires a certificate provider".to_string(),
                ));
            }

            Transport::Tls(TlsTransport {
                endpoint,
                ws_config,
                ca_bundle,
                client_certificate,
                security,
            })
        } else {
            Transport::Plain(PlainTransport {
                endpoint,
                ws_config,
            })
        };

        info!(
            "Transport: Profile {} -> {}",
            config.security_profile,
            transport.endpoint().url
        );
        Ok(transport)
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Transport::Plain(t) => &t.endpoint,
            Transport::Tls(t) => &t.endpoint,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Open the WebSocket. Never retries.
    async fn connect(&self) -> Result<WsStream, ConnectError> {
        let (endpoint, ws_config, connector) = match self {
            Transport::Plain(t) => (&t.endpoint, t.ws_config, Connector::Plain),
            Transport::Tls(t) => (&t.endpoint, t.ws_config, Connector::NativeTls(t.connector()?)),
        };

        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
        if let Some(auth) = &endpoint.authorization {
            let value = HeaderValue::from_str(auth)
                .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let (ws_stream, response) =
            connect_async_tls_with_config(request, Some(ws_config), false, Some(connector))
                .await
                .map_err(map_connect_error)?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "Transport: CSMS did not accept {} subprotocol, got: {:?}",
                OCPP_SUBPROTOCOL, accepted_protocol
            );
        }

        Ok(ws_stream)
    }

    /// Spawn the driver task
    pub fn spawn(self) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (handle, commands) = TransportHandle::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(commands, events_tx));
        (handle, events_rx)
    }

    /// Driver loop: executes commands, forwards inbound frames, reports
    /// connection changes. Ends when the command stream closes.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<TransportCommand>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut conn: Option<WsStream> = None;
        let mut reconnect_at: Option<Instant> = None;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        TransportCommand::Connect => {
                            reconnect_at = None;
                            if conn.is_none() {
                                conn = self.open(&events).await;
                            }
                        }
                        TransportCommand::Disconnect => {
                            reconnect_at = None;
                            close(&mut conn, &events, "disconnect requested", true).await;
                        }
                        TransportCommand::Reconnect { reason, delay } => {
                            close(&mut conn, &events, &reason, true).await;
                            info!("Transport: Reconnecting in {:?} ({})", delay, reason);
                            reconnect_at = Some(Instant::now() + delay);
                        }
                        TransportCommand::Send(frame) => {
                            let Some(ws) = conn.as_mut() else {
                                debug!("Transport: Not connected, dropping frame");
                                continue;
                            };
                            debug!("Sending: {}", frame);
                            if let Err(e) = ws.send(Message::Text(frame)).await {
                                error!("Transport: Send failed: {}", e);
                                conn = None;
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: format!("send failed: {}", e),
                                    requested: false,
                                });
                            }
                        }
                    }
                }

                frame = next_frame(&mut conn) => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received: {}", text);
                            let _ = events.send(TransportEvent::Message(text));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Transport: Ignoring {} byte binary frame", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Transport: WebSocket closed by server: {:?}", frame);
                            conn = None;
                            let _ = events.send(TransportEvent::Disconnected {
                                reason: "closed by CSMS".to_string(),
                                requested: false,
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Transport: WebSocket error: {}", e);
                            conn = None;
                            let _ = events.send(TransportEvent::Disconnected {
                                reason: e.to_string(),
                                requested: false,
                            });
                        }
                        None => {
                            info!("Transport: WebSocket stream ended");
                            conn = None;
                            let _ = events.send(TransportEvent::Disconnected {
                                reason: "stream ended".to_string(),
                                requested: false,
                            });
                        }
                    }
                }

                _ = wait_until(reconnect_at) => {
                    reconnect_at = None;
                    if conn.is_none() {
                        conn = self.open(&events).await;
                    }
                }
            }
        }

        close(&mut conn, &events, "transport dropped", true).await;
        debug!("Transport: Driver stopped");
    }

    async fn open(&self, events: &mpsc::UnboundedSender<TransportEvent>) -> Option<WsStream> {
        info!("Transport: Connecting to CSMS: {}", self.endpoint().url);
        match self.connect().await {
            Ok(ws) => {
                info!("Transport: WebSocket connected to {}", self.endpoint().url);
                let _ = events.send(TransportEvent::Connected);
                Some(ws)
            }
            Err(e) => {
                error!("Transport: Connection failed: {}", e);
                if e == TransportError::CertificateMissing {
                    let _ = events.send(TransportEvent::CertificateSignRequested);
                }
                let _ = events.send(TransportEvent::ConnectFailed(e));
                None
            }
        }
    }
}

impl TlsTransport {
    fn connector(&self) -> Result<native_tls::TlsConnector, TransportError> {
        let provider_roots = match (&self.ca_bundle, &self.security) {
            (None, Some(provider)) => provider.csms_root_certificates(),
            _ => None,
        };
        let roots = self.ca_bundle.as_deref().or(provider_roots.as_deref());

        let key_pair = if self.client_certificate {
            let provider = self
                .security
                .as_ref()
                .ok_or(TransportError::CertificateMissing)?;
            Some(
                provider
                    .get_key_pair()
                    .ok_or(TransportError::CertificateMissing)?,
            )
        } else {
            None
        };

        tls_connector(roots, key_pair.as_ref())
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Io(e) => TransportError::Unreachable(e.to_string()),
        WsError::Tls(e) => TransportError::Handshake(e.to_string()),
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            TransportError::Rejected(format!("HTTP {}", response.status()))
        }
        other => TransportError::Rejected(other.to_string()),
    }
}

async fn close(
    conn: &mut Option<WsStream>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    reason: &str,
    requested: bool,
) {
    if let Some(mut ws) = conn.take() {
        if let Err(e) = ws.close(None).await {
            debug!("Transport: Close handshake failed: {}", e);
        }
        let _ = events.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
            requested,
        });
    }
}

async fn next_frame(conn: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match conn {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

/// Sleep until `at`, or forever when there is nothing to wait for
pub(crate) async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
