//! Session state machine over a framed transport.
//!
//! A [`Connection`] owns one transport for its whole lifetime, drives the
//! hello/auth sequence, keeps the session alive with correlated pings, and
//! reconnects after unexpected transport loss. All inbound messages flow
//! through a single processing task, so dispatch order matches wire order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::commands::{
    ButtonCommand, ClimateCommand, CoverCommand, FanCommand, LightCommand, LockCommand,
    MediaPlayerCommand, NumberCommand, SelectCommand, SirenCommand, SwitchCommand, TextCommand,
};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, EventFilter, Subscription};
use crate::protocol::ProtoMessage;
use crate::protocol::message::{
    BluetoothDeviceRequest, BluetoothDeviceRequestType, BluetoothGattGetServicesRequest,
    CameraImageRequest, ConnectRequest, ConnectResponse, GetTimeResponse, HelloRequest,
    HelloResponse, LIST_ENTITIES_RESPONSES, MessageType, SubscribeLogsRequest,
    parse_raw_advertisements,
};
use crate::transport::{FrameEvent, FrameTransport, NoiseTransport, PlaintextTransport};

/// Default native API port.
pub const DEFAULT_PORT: u16 = 6053;

/// Default reconnect delay after unexpected transport loss.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Default keepalive ping interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default number of consecutive missed pings that forces closure.
pub const DEFAULT_MAX_MISSED_PINGS: u32 = 3;

/// Default correlated call timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for pairing-class BLE calls.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Oldest protocol minor version that authenticates through the encrypted
/// handshake itself. Devices below it still expect the legacy connect
/// exchange even when a key is configured.
const MIN_AUTH_FREE_MINOR_VERSION: u32 = 8;

/// Gets the current Unix timestamp as a u32.
fn current_timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Configuration for a device session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Legacy API password.
    pub password: String,
    /// Client identifier sent in the hello, shown in device logs.
    pub client_info: String,
    /// When set, the session fails unless the device reports this name.
    pub expected_server_name: Option<String>,
    /// Reconnect automatically after unexpected transport loss.
    pub reconnect: bool,
    /// Delay before a reconnect attempt.
    pub reconnect_interval: Duration,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Consecutive missed pings that force transport closure.
    pub max_missed_pings: u32,
    /// Timeout for correlated calls.
    pub request_timeout: Duration,
    /// Timeout for pairing-class BLE calls.
    pub pairing_timeout: Duration,
}

impl ConnectionConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            password: String::new(),
            client_info: concat!("esphome-native-api ", env!("CARGO_PKG_VERSION")).to_string(),
            expected_server_name: None,
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_missed_pings: DEFAULT_MAX_MISSED_PINGS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
        }
    }

    /// Sets the TCP port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the legacy API password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Sets the client identifier.
    #[must_use]
    pub fn client_info(mut self, client_info: impl Into<String>) -> Self {
        self.client_info = client_info.into();
        self
    }

    /// Requires the device to report the given name.
    #[must_use]
    pub fn expected_server_name(mut self, name: impl Into<String>) -> Self {
        self.expected_server_name = Some(name.into());
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub const fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the reconnect delay.
    #[must_use]
    pub const fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the keepalive ping interval.
    #[must_use]
    pub const fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the missed-ping threshold.
    #[must_use]
    pub const fn max_missed_pings(mut self, count: u32) -> Self {
        self.max_missed_pings = count;
        self
    }

    /// Sets the correlated call timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration {
                message: "host must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Hello sent, waiting for the server hello.
    HelloSent,
    /// Legacy authentication in progress.
    Authenticating,
    /// Session established, requests are accepted.
    Authorized,
}

struct ConnectionShared<T> {
    config: ConnectionConfig,
    transport: Mutex<T>,
    dispatcher: EventDispatcher,
    state: RwLock<ConnectionState>,
    process_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    ping_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    manual_disconnect: AtomicBool,
}

/// Client session with a device.
pub struct Connection<T> {
    shared: Arc<ConnectionShared<T>>,
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .finish_non_exhaustive()
    }
}

impl Connection<PlaintextTransport> {
    /// Creates a plaintext session.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the host is empty.
    pub fn plaintext(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let transport = PlaintextTransport::new(config.address());
        Ok(Self::with_transport(config, transport))
    }
}

impl Connection<NoiseTransport> {
    /// Creates an encrypted session from a base64 pre-shared key.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the host is empty or the key does
    /// not decode to exactly 32 bytes.
    pub fn noise(config: ConnectionConfig, encryption_key: &str) -> Result<Self> {
        config.validate()?;
        let decoded = BASE64
            .decode(encryption_key)
            .map_err(|e| Error::Configuration {
                message: format!("encryption key is not valid base64: {e}"),
            })?;
        let psk: [u8; 32] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            Error::Configuration {
                message: format!(
                    "encryption key must decode to 32 bytes, got {}",
                    bytes.len()
                ),
            }
        })?;
        let transport = NoiseTransport::new(
            config.address(),
            psk,
            config.expected_server_name.clone(),
        );
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: FrameTransport + 'static> Connection<T> {
    fn with_transport(config: ConnectionConfig, transport: T) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                config,
                transport: Mutex::new(transport),
                dispatcher: EventDispatcher::new(256),
                state: RwLock::new(ConnectionState::Disconnected),
                process_task: std::sync::Mutex::new(None),
                ping_task: std::sync::Mutex::new(None),
                reconnect_task: std::sync::Mutex::new(None),
                manual_disconnect: AtomicBool::new(false),
            }),
        }
    }

    /// Connects and establishes the session.
    ///
    /// Drives transport connect, the hello exchange and, where required,
    /// legacy password authentication. Resolves once the session is
    /// authorized and the keepalive timer is running.
    ///
    /// # Errors
    ///
    /// Fails synchronously when a session is already active; any failure
    /// during establishment force-closes the transport and is returned.
    pub async fn connect(&self) -> Result<()> {
        self.shared.manual_disconnect.store(false, Ordering::SeqCst);
        cancel_task(&self.shared.reconnect_task);
        connect_inner(&self.shared).await
    }

    /// Disconnects and tears the session down.
    ///
    /// A best-effort disconnect request is sent so the device releases the
    /// session immediately instead of waiting for a dead socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.manual_disconnect.store(true, Ordering::SeqCst);
        cancel_task(&self.shared.reconnect_task);

        let connected = {
            let transport = self.shared.transport.lock().await;
            transport.is_connected()
        };
        if connected {
            let request = ProtoMessage::empty(MessageType::DisconnectRequest);
            let _ = self
                .shared
                .send_and_wait(
                    request,
                    &[MessageType::DisconnectResponse],
                    self.shared.config.request_timeout,
                )
                .await;
        }

        teardown(&self.shared).await?;
        Ok(())
    }

    /// Current session state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Returns true while the transport is connected.
    pub async fn is_connected(&self) -> bool {
        self.shared.transport.lock().await.is_connected()
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.shared.dispatcher.subscribe()
    }

    /// Sends a message without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn send_message(&self, message: ProtoMessage) -> Result<()> {
        self.shared.send_raw(message).await
    }

    /// Sends a message and waits for the next message of the expected type.
    ///
    /// The subscription is registered before the send, so a response cannot
    /// slip through between the two. The timeout is per call.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when no matching message arrives in time.
    pub async fn send_message_await_response(
        &self,
        message: ProtoMessage,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<ProtoMessage> {
        self.shared.send_and_wait(message, &[expected], timeout).await
    }

    /// Sends a state-changing command.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the session is not connected and authorized;
    /// nothing is sent in that case.
    pub async fn send_command(&self, message: ProtoMessage) -> Result<()> {
        self.shared.check_authorized().await?;
        self.shared.send_raw(message).await
    }

    // ==================== Device services ====================

    /// Queries device metadata.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or transport failure.
    pub async fn device_info(&self) -> Result<ProtoMessage> {
        self.shared
            .send_and_wait(
                ProtoMessage::empty(MessageType::DeviceInfoRequest),
                &[MessageType::DeviceInfoResponse],
                self.shared.config.request_timeout,
            )
            .await
    }

    /// Queries the device's current time.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or transport failure.
    pub async fn get_time(&self) -> Result<u32> {
        let response = self
            .shared
            .send_and_wait(
                ProtoMessage::empty(MessageType::GetTimeRequest),
                &[MessageType::GetTimeResponse],
                self.shared.config.request_timeout,
            )
            .await?;
        Ok(GetTimeResponse::parse(&response.payload)?.epoch_seconds)
    }

    /// Lists all entities the device exposes.
    ///
    /// Accumulates one description message per entity until the done marker
    /// arrives, preserving wire order.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or transport failure.
    pub async fn list_entities(&self) -> Result<Vec<ProtoMessage>> {
        self.shared
            .collect_until(
                ProtoMessage::empty(MessageType::ListEntitiesRequest),
                LIST_ENTITIES_RESPONSES,
                MessageType::ListEntitiesDoneResponse,
                self.shared.config.request_timeout,
            )
            .await
    }

    /// Subscribes to entity state updates.
    ///
    /// Updates arrive as message events; there is no reply to wait for.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn subscribe_states(&self) -> Result<()> {
        self.shared
            .send_raw(ProtoMessage::empty(MessageType::SubscribeStatesRequest))
            .await
    }

    /// Subscribes to the device's log output.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn subscribe_logs(&self, level: u32, dump_config: bool) -> Result<()> {
        self.shared
            .send_raw(SubscribeLogsRequest { level, dump_config }.encode())
            .await
    }

    /// Requests camera frames.
    ///
    /// Frames arrive as message events, possibly split across several
    /// messages for large images.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn camera_image(&self, single: bool, stream: bool) -> Result<()> {
        self.shared
            .send_raw(CameraImageRequest { single, stream }.encode())
            .await
    }

    // ==================== Bluetooth proxy services ====================

    /// Subscribes to BLE advertisements seen by the device.
    ///
    /// Decoded advertisements are published as `BleAdvertisement` events.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn subscribe_bluetooth_advertisements(&self) -> Result<()> {
        self.shared
            .send_raw(ProtoMessage::empty(
                MessageType::SubscribeBluetoothLEAdvertisementsRequest,
            ))
            .await
    }

    /// Stops BLE advertisement delivery.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport is not connected.
    pub async fn unsubscribe_bluetooth_advertisements(&self) -> Result<()> {
        self.shared
            .send_raw(ProtoMessage::empty(
                MessageType::UnsubscribeBluetoothLEAdvertisementsRequest,
            ))
            .await
    }

    /// Performs a BLE device operation and waits for its outcome.
    ///
    /// Pairing-class operations use the longer pairing timeout.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or transport failure.
    pub async fn bluetooth_device_request(
        &self,
        address: u64,
        request_type: BluetoothDeviceRequestType,
    ) -> Result<ProtoMessage> {
        let (expected, timeout) = match request_type {
            BluetoothDeviceRequestType::Connect | BluetoothDeviceRequestType::Disconnect => (
                MessageType::BluetoothDeviceConnectionResponse,
                self.shared.config.request_timeout,
            ),
            BluetoothDeviceRequestType::Pair => (
                MessageType::BluetoothDevicePairingResponse,
                self.shared.config.pairing_timeout,
            ),
            BluetoothDeviceRequestType::Unpair => (
                MessageType::BluetoothDeviceUnpairingResponse,
                self.shared.config.pairing_timeout,
            ),
            BluetoothDeviceRequestType::ClearCache => (
                MessageType::BluetoothDeviceClearCacheResponse,
                self.shared.config.pairing_timeout,
            ),
        };
        self.shared
            .send_and_wait(
                BluetoothDeviceRequest {
                    address,
                    request_type,
                }
                .encode(),
                &[expected],
                timeout,
            )
            .await
    }

    /// Lists the GATT services of a connected BLE device.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or transport failure.
    pub async fn bluetooth_gatt_get_services(&self, address: u64) -> Result<Vec<ProtoMessage>> {
        self.shared
            .collect_until(
                BluetoothGattGetServicesRequest { address }.encode(),
                &[MessageType::BluetoothGATTGetServicesResponse],
                MessageType::BluetoothGATTGetServicesDoneResponse,
                self.shared.config.request_timeout,
            )
            .await
    }

    // ==================== Entity commands ====================

    /// Sends a light command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn light_command(&self, command: &LightCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a switch command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn switch_command(&self, command: &SwitchCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a cover command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn cover_command(&self, command: &CoverCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a fan command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn fan_command(&self, command: &FanCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a climate command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn climate_command(&self, command: &ClimateCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a number command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn number_command(&self, command: &NumberCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a select command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn select_command(&self, command: &SelectCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a siren command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn siren_command(&self, command: &SirenCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a lock command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn lock_command(&self, command: &LockCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Presses a button entity.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn button_command(&self, command: &ButtonCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a media player command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn media_player_command(&self, command: &MediaPlayerCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }

    /// Sends a text command.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected and authorized.
    pub async fn text_command(&self, command: &TextCommand) -> Result<()> {
        self.send_command(command.encode()).await
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        cancel_task(&self.shared.process_task);
        cancel_task(&self.shared.ping_task);
        cancel_task(&self.shared.reconnect_task);
    }
}

fn cancel_task(slot: &std::sync::Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
        task.abort();
    }
}

fn store_task(slot: &std::sync::Mutex<Option<JoinHandle<()>>>, task: JoinHandle<()>) {
    let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(old) = guard.replace(task) {
        old.abort();
    }
}

impl<T: FrameTransport + 'static> ConnectionShared<T> {
    async fn send_raw(&self, message: ProtoMessage) -> Result<()> {
        let mut transport = self.transport.lock().await;
        transport.send_message(message).await
    }

    async fn check_authorized(&self) -> Result<()> {
        if !self.transport.lock().await.is_connected() {
            return Err(Error::NotConnected);
        }
        if *self.state.read().await != ConnectionState::Authorized {
            return Err(Error::NotAuthorized);
        }
        Ok(())
    }

    /// Sends a message and waits for the next message of an expected type.
    async fn send_and_wait(
        &self,
        message: ProtoMessage,
        expected: &[MessageType],
        timeout: Duration,
    ) -> Result<ProtoMessage> {
        // IMPORTANT: Subscribe BEFORE sending to avoid race conditions.
        // With broadcast channels, events are only delivered to subscribers
        // that exist at the time of dispatch. If we send first and then
        // subscribe, a fast response could be dispatched before our
        // subscription is created, causing us to miss it.
        let mut subscription = self.dispatcher.subscribe();

        self.send_raw(message).await?;

        let filter = EventFilter::message_types(expected.to_vec());
        match subscription.next_match(&filter, timeout).await {
            Some(Event::Message(msg)) => Ok(msg),
            // The filter only passes carried messages, so `Some` of any
            // other variant cannot happen; `None` here is the timeout (the
            // dispatcher outlives the call)
            _ => Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Sends a listing request and accumulates matching messages until the
    /// terminating marker arrives.
    async fn collect_until(
        &self,
        message: ProtoMessage,
        accumulate: &[MessageType],
        done: MessageType,
        timeout: Duration,
    ) -> Result<Vec<ProtoMessage>> {
        let mut subscription = self.dispatcher.subscribe();

        self.send_raw(message).await?;

        let mut collected = Vec::new();
        tokio::select! {
            biased;
            result = async {
                loop {
                    match subscription.recv().await {
                        Some(Event::Message(msg)) => {
                            if msg.message_type() == Some(done) {
                                return true;
                            }
                            if msg.message_type().is_some_and(|t| accumulate.contains(&t)) {
                                collected.push(msg);
                            }
                        }
                        Some(_) => {}
                        None => return false,
                    }
                }
            } => {
                if result {
                    Ok(collected)
                } else {
                    Err(Error::ChannelClosed)
                }
            }
            () = tokio::time::sleep(timeout) => Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

/// Drives transport connect, hello and authentication to `Authorized`.
async fn connect_inner<T: FrameTransport + 'static>(
    shared: &Arc<ConnectionShared<T>>,
) -> Result<()> {
    {
        let mut state = shared.state.write().await;
        if *state != ConnectionState::Disconnected {
            return Err(Error::AlreadyConnected);
        }
        *state = ConnectionState::Connecting;
    }

    match establish(shared).await {
        Ok(()) => Ok(()),
        Err(e) => {
            shared.dispatcher.dispatch(Event::Error {
                message: e.to_string(),
            });
            handle_connect_failure(shared).await;
            Err(e)
        }
    }
}

async fn establish<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) -> Result<()> {
    let events = {
        let mut transport = shared.transport.lock().await;
        transport.connect().await?;
        transport.take_events().ok_or(Error::NotConnected)?
    };

    let process = tokio::spawn(run_process_loop(Arc::clone(shared), events));
    store_task(&shared.process_task, process);
    shared.dispatcher.dispatch(Event::Connected);

    // Hello exchange
    *shared.state.write().await = ConnectionState::HelloSent;
    let hello_request = HelloRequest {
        client_info: shared.config.client_info.clone(),
    }
    .encode();
    let response = shared
        .send_and_wait(
            hello_request,
            &[MessageType::HelloResponse],
            shared.config.request_timeout,
        )
        .await?;
    let hello = HelloResponse::parse(&response.payload)?;
    tracing::info!(
        "device {} speaks api {}.{} ({})",
        hello.name,
        hello.api_version_major,
        hello.api_version_minor,
        hello.server_info
    );

    if let Some(expected) = &shared.config.expected_server_name {
        if !hello.name.is_empty() && hello.name != *expected {
            return Err(Error::Handshake {
                message: format!(
                    "server name mismatch: expected {expected}, got {}",
                    hello.name
                ),
            });
        }
    }

    // Devices with an older minor version authenticate with the legacy
    // connect exchange even when an encryption key is in use
    let needs_auth = !shared.config.password.is_empty()
        || hello.api_version_minor < MIN_AUTH_FREE_MINOR_VERSION;
    if needs_auth {
        *shared.state.write().await = ConnectionState::Authenticating;
        let request = ConnectRequest {
            password: shared.config.password.clone(),
        }
        .encode();
        let response = shared
            .send_and_wait(
                request,
                &[MessageType::ConnectResponse],
                shared.config.request_timeout,
            )
            .await?;
        if ConnectResponse::parse(&response.payload)?.invalid_password {
            return Err(Error::InvalidPassword);
        }
    }

    *shared.state.write().await = ConnectionState::Authorized;
    shared.dispatcher.dispatch(Event::Authorized);
    start_keepalive(shared);
    Ok(())
}

/// Cleans up after a failed establishment attempt.
async fn handle_connect_failure<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) {
    cancel_task(&shared.ping_task);
    cancel_task(&shared.process_task);
    {
        let mut transport = shared.transport.lock().await;
        let _ = transport.disconnect().await;
    }
    *shared.state.write().await = ConnectionState::Disconnected;
    shared.dispatcher.dispatch(Event::Disconnected);
    maybe_schedule_reconnect(shared);
}

/// Tears the session down after a manual disconnect.
async fn teardown<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) -> Result<()> {
    cancel_task(&shared.ping_task);
    cancel_task(&shared.process_task);

    let was_authorized = {
        let mut state = shared.state.write().await;
        let was = *state == ConnectionState::Authorized;
        *state = ConnectionState::Disconnected;
        was
    };

    {
        let mut transport = shared.transport.lock().await;
        transport.disconnect().await?;
    }

    if was_authorized {
        shared.dispatcher.dispatch(Event::Unauthorized);
    }
    shared.dispatcher.dispatch(Event::Disconnected);
    Ok(())
}

/// Consumes transport events, answering control messages and fanning the
/// rest out to subscribers. Runs until the transport stops producing.
async fn run_process_loop<T: FrameTransport + 'static>(
    shared: Arc<ConnectionShared<T>>,
    mut events: mpsc::Receiver<FrameEvent>,
) {
    loop {
        match events.recv().await {
            Some(FrameEvent::Message(message)) => {
                if handle_message(&shared, message).await {
                    break;
                }
            }
            Some(FrameEvent::Error(message)) => {
                tracing::error!("transport error: {}", message);
                shared.dispatcher.dispatch(Event::Error { message });
                break;
            }
            Some(FrameEvent::Closed) | None => break,
        }
    }
    handle_transport_closed(&shared).await;
}

/// Handles one inbound message. Returns true when the session must close.
async fn handle_message<T: FrameTransport + 'static>(
    shared: &Arc<ConnectionShared<T>>,
    message: ProtoMessage,
) -> bool {
    let mut close = false;
    match message.message_type() {
        Some(MessageType::DisconnectRequest) => {
            tracing::info!("peer requested disconnect");
            let _ = shared
                .send_raw(ProtoMessage::empty(MessageType::DisconnectResponse))
                .await;
            close = true;
        }
        Some(MessageType::PingRequest) => {
            let _ = shared
                .send_raw(ProtoMessage::empty(MessageType::PingResponse))
                .await;
        }
        Some(MessageType::GetTimeRequest) => {
            let reply = GetTimeResponse {
                epoch_seconds: current_timestamp(),
            }
            .encode();
            let _ = shared.send_raw(reply).await;
        }
        Some(MessageType::BluetoothLERawAdvertisementsResponse) => {
            match parse_raw_advertisements(&message.payload) {
                Ok(entries) => {
                    for entry in &entries {
                        shared.dispatcher.dispatch(Event::BleAdvertisement(Box::new(
                            crate::advertisement::Advertisement::from_raw(entry),
                        )));
                    }
                }
                Err(e) => tracing::warn!("failed to parse raw advertisement batch: {}", e),
            }
        }
        _ => {}
    }
    shared.dispatcher.dispatch(Event::Message(message));
    close
}

/// Resets state after transport loss and applies the reconnect policy.
async fn handle_transport_closed<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) {
    let was_authorized = {
        let mut state = shared.state.write().await;
        if *state == ConnectionState::Disconnected {
            // Manual teardown already ran
            return;
        }
        let was = *state == ConnectionState::Authorized;
        *state = ConnectionState::Disconnected;
        was
    };

    cancel_task(&shared.ping_task);
    {
        let mut transport = shared.transport.lock().await;
        let _ = transport.disconnect().await;
    }

    if was_authorized {
        shared.dispatcher.dispatch(Event::Unauthorized);
    }
    shared.dispatcher.dispatch(Event::Disconnected);
    maybe_schedule_reconnect(shared);
}

fn maybe_schedule_reconnect<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) {
    if !shared.config.reconnect || shared.manual_disconnect.load(Ordering::SeqCst) {
        return;
    }
    let delay = shared.config.reconnect_interval;
    shared
        .dispatcher
        .dispatch(Event::ReconnectScheduled { delay });
    tracing::info!("reconnecting in {:?}", delay);

    let shared_task = Arc::clone(shared);
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = connect_inner(&shared_task).await {
            tracing::warn!("reconnect attempt failed: {}", e);
        }
    });
    store_task(&shared.reconnect_task, task);
}

/// Starts the keepalive ping task.
fn start_keepalive<T: FrameTransport + 'static>(shared: &Arc<ConnectionShared<T>>) {
    let shared_task = Arc::clone(shared);
    let task = tokio::spawn(async move {
        let mut misses: u32 = 0;
        loop {
            tokio::time::sleep(shared_task.config.keepalive_interval).await;
            let result = shared_task
                .send_and_wait(
                    ProtoMessage::empty(MessageType::PingRequest),
                    &[MessageType::PingResponse],
                    shared_task.config.request_timeout,
                )
                .await;
            match result {
                Ok(_) => misses = 0,
                Err(e) => {
                    misses += 1;
                    tracing::warn!(
                        "keepalive ping failed ({}/{}): {}",
                        misses,
                        shared_task.config.max_missed_pings,
                        e
                    );
                    if misses >= shared_task.config.max_missed_pings {
                        shared_task.dispatcher.dispatch(Event::Error {
                            message: format!(
                                "{misses} consecutive keepalive pings missed, closing"
                            ),
                        });
                        // Closing the transport stops the read loop, which
                        // ends the process loop and runs the closed handler
                        let mut transport = shared_task.transport.lock().await;
                        let _ = transport.disconnect().await;
                        return;
                    }
                }
            }
        }
    });
    store_task(&shared.ping_task, task);
}
