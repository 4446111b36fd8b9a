//! Device session worker.
//!
//! One [`DeviceSession`] owns the socket to one appliance and runs on its own
//! task. It connects (with the V3 handshake when needed), refreshes the status,
//! then loops over refresh, heartbeat and receive until the socket dies, after
//! which it reconnects. Other tasks talk to it through a cloneable
//! [`SessionHandle`].

use bytes::{Bytes, BytesMut};
use midea_wire::{
    open_packet, split_v2_packets, FrameCodec, FrameType, MessageRequest, MessageResponse,
    MessageType, PacketBuilder, PacketContent, ProtocolVersion, ERROR_SENTINEL,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::attributes::{AttributeMap, AttributeValue, SharedState};
use crate::device::{Command, Credentials, DeviceInfo, DeviceKind, SetAction};
use crate::error::{CodecError, SessionError};
use crate::handshake::authenticate;
use crate::keepalive::{build_heartbeat, KeepaliveSchedule};
use crate::transport::{Connector, DeviceStream, TcpConnector};
use crate::unsupported::UnsupportedCommands;

/// Class name of the appliance description query
const QUERY_APPLIANCE_CLASS: &str = "query_appliance";

/// Configuration for a device session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Wait for the handshake response and for each initial-refresh reply
    pub response_timeout: Duration,
    /// Read timeout of the receive loop
    pub read_timeout: Duration,
    /// Consecutive read timeouts before the socket is dropped
    pub max_read_timeouts: u32,
    /// Pause between failed connection attempts
    pub reconnect_delay: Duration,
    /// Status refresh period, zero disables
    pub refresh_interval: Duration,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Bytes read per receive
    pub read_chunk_size: usize,
    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            max_read_timeouts: 120,
            reconnect_delay: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            read_chunk_size: 512,
            command_buffer: 32,
        }
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// V3 handshake in progress
    Handshaking,
    /// Waiting for the first status replies
    InitialRefresh,
    /// Connected and refreshed
    Ready,
    /// Tearing the socket down
    Closing,
}

/// Outcome of feeding received bytes to [`DeviceSession::parse_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// At least one complete packet was handled
    Success,
    /// Only a partial packet so far
    Padding,
    /// The device sent the error sentinel or undecodable data
    Error,
}

/// Requests executed on the session worker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Send a raw body with the given message type
    Custom {
        /// Message type byte
        message_type: u8,
        /// Body, starting with the body type
        body: Bytes,
    },
    /// Change one attribute through the device codec
    SetAttribute {
        /// Attribute name
        name: String,
        /// New value
        value: AttributeValue,
    },
    /// Send the status queries now
    Refresh,
    /// Change the status refresh period, zero disables
    SetRefreshInterval(Duration),
    /// Use a new address from the next connect on
    SetIpAddress(Ipv4Addr),
    /// Leave the run loop
    Stop,
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    shared: Arc<SharedState>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("shared", &self.shared)
            .finish()
    }
}

impl SessionHandle {
    /// Snapshot of every attribute
    pub fn attributes(&self) -> AttributeMap {
        self.shared.attributes().clone()
    }

    /// Current value of one attribute
    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.shared.attributes().get(name).cloned()
    }

    /// Whether the session is connected and refreshed
    pub fn is_available(&self) -> bool {
        self.shared.is_available()
    }

    /// Whether the worker is still running
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Register a callback receiving every set of changed attributes
    pub fn register_update<F>(&self, observer: F)
    where
        F: Fn(&AttributeMap) + Send + Sync + 'static,
    {
        self.shared.register(Arc::new(observer));
    }

    /// Queue a raw command
    pub async fn send_command(
        &self,
        message_type: u8,
        body: impl Into<Bytes>,
    ) -> Result<(), SessionError> {
        self.submit(SessionCommand::Custom {
            message_type,
            body: body.into(),
        })
        .await
    }

    /// Queue an attribute change
    pub async fn set_attribute(
        &self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), SessionError> {
        self.submit(SessionCommand::SetAttribute {
            name: name.into(),
            value: value.into(),
        })
        .await
    }

    /// Queue a status refresh
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.submit(SessionCommand::Refresh).await
    }

    /// Change the status refresh period; zero disables periodic refreshes
    pub async fn set_refresh_interval(&self, interval: Duration) -> Result<(), SessionError> {
        self.submit(SessionCommand::SetRefreshInterval(interval)).await
    }

    /// Point the session at a new address; the current socket is dropped
    pub async fn set_ip_address(&self, ip: Ipv4Addr) -> Result<(), SessionError> {
        self.submit(SessionCommand::SetIpAddress(ip)).await
    }

    /// Ask the worker to stop
    pub fn stop(&self) {
        self.shared.set_running(false);
        // a full channel still sees the cleared flag at the next loop boundary
        let _ = self.commands.try_send(SessionCommand::Stop);
    }

    async fn submit(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::NotConnected)
    }
}

/// Worker owning the connection to one appliance
pub struct DeviceSession {
    info: DeviceInfo,
    credentials: Option<Credentials>,
    config: SessionConfig,
    codec: Box<dyn DeviceKind>,
    connector: Arc<dyn Connector>,
    shared: Arc<SharedState>,
    commands: mpsc::Receiver<SessionCommand>,
    state: SessionState,
    stream: Option<Box<dyn DeviceStream>>,
    frames: FrameCodec,
    buffer: BytesMut,
    unsupported: UnsupportedCommands,
    device_protocol_version: u8,
    appliance_query_pending: bool,
}

impl DeviceSession {
    /// Create a session and the handle used to drive it
    pub fn new(
        info: DeviceInfo,
        credentials: Option<Credentials>,
        codec: Box<dyn DeviceKind>,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let shared = Arc::new(SharedState::new());
        shared.apply(&codec.initial_attributes());
        shared.set_running(true);

        let handle = SessionHandle {
            commands: tx,
            shared: shared.clone(),
        };
        let session = Self {
            info,
            credentials,
            config,
            codec,
            connector: Arc::new(TcpConnector),
            shared,
            commands: rx,
            state: SessionState::Disconnected,
            stream: None,
            frames: FrameCodec::new(),
            buffer: BytesMut::new(),
            unsupported: UnsupportedCommands::new(),
            device_protocol_version: 0,
            appliance_query_pending: true,
        };
        (session, handle)
    }

    /// Replace the TCP connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Device identity and endpoint
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Current connection state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Device protocol version learned from the appliance query (0 until known)
    pub fn device_protocol_version(&self) -> u8 {
        self.device_protocol_version
    }

    /// Register a callback receiving every set of changed attributes
    pub fn register_update<F>(&self, observer: F)
    where
        F: Fn(&AttributeMap) + Send + Sync + 'static,
    {
        self.shared.register(Arc::new(observer));
    }

    /// Use `ip` from the next connect on and drop the current socket
    pub fn set_ip_address(&mut self, ip: Ipv4Addr) {
        if self.info.ip != ip {
            info!("Device {} moved from {} to {}", self.info.device_id, self.info.ip, ip);
        }
        self.info.ip = ip;
        self.close_socket();
    }

    /// Change the status refresh period used from the next serve loop on
    pub fn set_refresh_interval(&mut self, interval: Duration) {
        debug!("Device {} refresh interval set to {:?}", self.info.device_id, interval);
        self.config.refresh_interval = interval;
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, serve and reconnect until stopped
    pub async fn run(mut self) {
        info!("Starting session for device {}", self.info.device_id);

        while self.shared.is_running() {
            if self.connect(true).await {
                self.serve().await;
                self.close_socket();
                continue;
            }
            self.backoff().await;
        }

        self.close_socket();
        info!("Session for device {} stopped", self.info.device_id);
    }

    /// Open the socket, authenticate (V3) and optionally refresh.
    ///
    /// Broadcasts the outcome as the `available` attribute.
    pub async fn connect(&mut self, initial_refresh: bool) -> bool {
        self.close_socket();
        let addr = self.endpoint();
        self.state = SessionState::Connecting;
        debug!("Connecting to device {} at {}", self.info.device_id, addr);

        match self.establish(addr, initial_refresh).await {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!("Connected to device {} at {}", self.info.device_id, addr);
                self.shared.set_available(true);
                true
            }
            Err(e) => {
                warn!("Connection to device {} at {} failed: {}", self.info.device_id, addr, e);
                self.close_socket();
                self.shared.set_available(false);
                false
            }
        }
    }

    async fn establish(
        &mut self,
        addr: SocketAddr,
        initial_refresh: bool,
    ) -> Result<(), SessionError> {
        let mut stream = self.connector.connect(addr, self.config.connect_timeout).await?;
        self.frames = FrameCodec::new();
        self.buffer.clear();

        if self.info.protocol == ProtocolVersion::V3 {
            self.state = SessionState::Handshaking;
            let credentials = self.credentials.as_ref().ok_or_else(|| {
                SessionError::Credentials("V3 device needs a token and key".into())
            })?;
            let handshake = authenticate(
                &mut stream,
                &mut self.frames,
                credentials,
                self.config.response_timeout,
            )
            .await?;
            self.buffer.extend_from_slice(&handshake.leftover);
        }
        self.stream = Some(stream);

        if initial_refresh {
            self.state = SessionState::InitialRefresh;
            self.refresh_status(true).await?;
            self.send_capabilities_query().await?;
        }
        Ok(())
    }

    /// Send the status queries, skipping unsupported classes.
    ///
    /// With `wait`, each reply is awaited; a query that times out is marked
    /// unsupported, and `RefreshFailed` is returned if no query succeeded.
    pub async fn refresh_status(&mut self, wait: bool) -> Result<(), SessionError> {
        let mut commands = Vec::new();
        if self.appliance_query_pending {
            commands.push(Command::new(
                QUERY_APPLIANCE_CLASS,
                MessageRequest::query_appliance(self.codec.device_type()),
            ));
        }
        commands.extend(self.codec.build_query(self.device_protocol_version));

        let mut failed = 0;
        for command in &commands {
            if self.unsupported.contains(&command.class) {
                failed += 1;
                continue;
            }

            self.send_message(&command.request).await?;
            if !wait {
                continue;
            }

            match self.await_reply().await {
                Ok(ParseResult::Success) => {}
                Ok(_) => failed += 1,
                Err(SessionError::Timeout(_)) => {
                    failed += 1;
                    self.unsupported.mark(&command.class);
                    debug!(
                        "Device {} does not support {}, ignored",
                        self.info.device_id, command.class
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if wait && !commands.is_empty() && failed == commands.len() {
            return Err(SessionError::RefreshFailed);
        }
        Ok(())
    }

    async fn send_capabilities_query(&mut self) -> Result<(), SessionError> {
        for command in self.codec.capabilities_query(self.device_protocol_version) {
            self.send_message(&command.request).await?;
        }
        Ok(())
    }

    /// Send a raw body with `message_type`, using the learned protocol version
    pub async fn send_command(
        &mut self,
        message_type: u8,
        body: Bytes,
    ) -> Result<(), SessionError> {
        let request = MessageRequest::custom(
            self.codec.device_type(),
            self.device_protocol_version,
            message_type,
            body,
        );
        self.send_message(&request).await
    }

    /// Change one attribute through the codec
    pub async fn set_attribute(
        &mut self,
        name: &str,
        value: &AttributeValue,
    ) -> Result<(), SessionError> {
        match self
            .codec
            .set_attribute(name, value, self.device_protocol_version)?
        {
            SetAction::Send(request) => self.send_message(&request).await,
            SetAction::Local(changes) => {
                self.shared.apply(&changes);
                self.shared.update_all(&changes);
                Ok(())
            }
        }
    }

    async fn send_message(&mut self, request: &MessageRequest) -> Result<(), SessionError> {
        let envelope = request.serialize()?;
        debug!("Sending to device {}: {}", self.info.device_id, hex::encode(&envelope));
        let packet = PacketBuilder::new(self.info.device_id).command(&envelope);
        self.send_packet(packet).await
    }

    async fn send_heartbeat(&mut self) -> Result<(), SessionError> {
        trace!("Heartbeat to device {}", self.info.device_id);
        self.send_packet(build_heartbeat(self.info.device_id)).await
    }

    async fn send_packet(&mut self, packet: Bytes) -> Result<(), SessionError> {
        let data = if self.info.protocol == ProtocolVersion::V3 {
            self.frames.encode(&packet, FrameType::EncryptedRequest)?
        } else {
            packet
        };

        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        stream.write_all(&data).await?;
        Ok(())
    }

    async fn await_reply(&mut self) -> Result<ParseResult, SessionError> {
        loop {
            let chunk = read_chunk(
                self.stream.as_mut(),
                self.config.read_chunk_size,
                self.config.response_timeout,
            )
            .await?;

            match self.parse_message(&chunk) {
                ParseResult::Padding => continue,
                result => return Ok(result),
            }
        }
    }

    async fn serve(&mut self) {
        let mut schedule = KeepaliveSchedule::new(
            self.config.refresh_interval,
            self.config.heartbeat_interval,
            Instant::now(),
        );
        let mut timeouts = 0u32;

        while self.shared.is_running() {
            let now = Instant::now();
            if schedule.refresh_due(now) {
                schedule.refreshed(now);
                if let Err(e) = self.refresh_status(false).await {
                    debug!("Refresh of device {} failed: {}", self.info.device_id, e);
                    return;
                }
            }
            if schedule.heartbeat_due(now) {
                schedule.heartbeat_sent(now);
                if let Err(e) = self.send_heartbeat().await {
                    debug!("Heartbeat to device {} failed: {}", self.info.device_id, e);
                    return;
                }
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Stop) | None => {
                        self.shared.set_running(false);
                        return;
                    }
                    Some(SessionCommand::SetIpAddress(ip)) => {
                        self.set_ip_address(ip);
                        return;
                    }
                    Some(SessionCommand::SetRefreshInterval(interval)) => {
                        self.set_refresh_interval(interval);
                        schedule.set_refresh_interval(interval);
                    }
                    Some(command) => {
                        if let Err(e) = self.execute(command).await {
                            if e.is_connection_error() {
                                debug!("Socket error on device {}: {}", self.info.device_id, e);
                                return;
                            }
                            warn!("Command for device {} failed: {}", self.info.device_id, e);
                        }
                    }
                },
                read = read_chunk(
                    self.stream.as_mut(),
                    self.config.read_chunk_size,
                    self.config.read_timeout,
                ) => match read {
                    Ok(chunk) => match self.parse_message(&chunk) {
                        ParseResult::Error => {
                            debug!("Message 'ERROR' received from device {}", self.info.device_id);
                            return;
                        }
                        ParseResult::Success => timeouts = 0,
                        ParseResult::Padding => {}
                    },
                    Err(SessionError::Timeout(_)) => {
                        timeouts += 1;
                        if timeouts >= self.config.max_read_timeouts {
                            debug!("Heartbeat of device {} timed out", self.info.device_id);
                            return;
                        }
                    }
                    Err(SessionError::ConnectionClosed) => {
                        error!("Device {} closed the connection", self.info.device_id);
                        return;
                    }
                    Err(e) => {
                        debug!("Socket error on device {}: {}", self.info.device_id, e);
                        return;
                    }
                },
            }
        }
    }

    async fn execute(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        match command {
            SessionCommand::Custom { message_type, body } => {
                self.send_command(message_type, body).await
            }
            SessionCommand::SetAttribute { name, value } => self.set_attribute(&name, &value).await,
            SessionCommand::Refresh => self.refresh_status(false).await,
            SessionCommand::SetRefreshInterval(interval) => {
                self.set_refresh_interval(interval);
                Ok(())
            }
            SessionCommand::SetIpAddress(ip) => {
                self.set_ip_address(ip);
                Ok(())
            }
            SessionCommand::Stop => {
                self.shared.set_running(false);
                Ok(())
            }
        }
    }

    async fn backoff(&mut self) {
        let delay = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Stop) | None => {
                        self.shared.set_running(false);
                        return;
                    }
                    Some(SessionCommand::SetIpAddress(ip)) => self.info.ip = ip,
                    Some(SessionCommand::SetRefreshInterval(interval)) => {
                        self.set_refresh_interval(interval)
                    }
                    Some(command) => warn!(
                        "Device {} is not connected, dropping {:?}",
                        self.info.device_id, command
                    ),
                },
            }
        }
    }

    /// Feed received bytes; complete packets are decrypted and handed to the codec.
    ///
    /// Observers are notified once with the changes of every packet handled.
    pub fn parse_message(&mut self, msg: &[u8]) -> ParseResult {
        self.buffer.extend_from_slice(msg);
        if self.buffer.starts_with(ERROR_SENTINEL) {
            self.buffer.clear();
            return ParseResult::Error;
        }

        let decoded = if self.info.protocol == ProtocolVersion::V3 {
            self.frames.decode_frames(&self.buffer)
        } else {
            split_v2_packets(&self.buffer)
        };
        let (packets, rest) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "Undecodable data from device {}: {}, buffer = {}",
                    self.info.device_id,
                    e,
                    hex::encode(&self.buffer)
                );
                self.buffer.clear();
                return ParseResult::Error;
            }
        };
        self.buffer = BytesMut::from(&rest[..]);

        if packets.is_empty() {
            return ParseResult::Padding;
        }

        let mut result = ParseResult::Success;
        let mut changes = AttributeMap::new();
        for packet in packets {
            if packet[..] == *ERROR_SENTINEL {
                result = ParseResult::Error;
                break;
            }

            match open_packet(&packet) {
                PacketContent::Heartbeat => trace!("Heartbeat from device {}", self.info.device_id),
                PacketContent::Envelope(envelope) => self.process_envelope(&envelope, &mut changes),
                PacketContent::IllegalPayload {
                    payload_type,
                    alleged,
                    actual,
                } => warn!(
                    "Illegal payload from device {}: {}, payload type = {:#06x}, alleged length = {}, factual length = {}",
                    self.info.device_id,
                    hex::encode(&packet),
                    payload_type,
                    alleged,
                    actual
                ),
                PacketContent::IllegalMessage { len } => warn!(
                    "Illegal message from device {}: {}, length = {}",
                    self.info.device_id,
                    hex::encode(&packet),
                    len
                ),
            }
        }

        if !changes.is_empty() {
            self.shared.apply(&changes);
            self.shared.update_all(&changes);
        }
        result
    }

    fn process_envelope(&mut self, envelope: &[u8], changes: &mut AttributeMap) {
        debug!("Received from device {}: {}", self.info.device_id, hex::encode(envelope));

        if self.appliance_query_pending
            && envelope.len() > 9
            && envelope[9] == u8::from(MessageType::QueryAppliance)
        {
            self.appliance_query_pending = false;
            self.device_protocol_version = envelope[8];
            debug!(
                "Device {} protocol version: {}",
                self.info.device_id, self.device_protocol_version
            );
            return;
        }

        let status = MessageResponse::parse(envelope)
            .map_err(CodecError::from)
            .and_then(|response| self.codec.process_message(&response));
        match status {
            Ok(status) if status.is_empty() => {
                debug!("Unidentified protocol from device {}", self.info.device_id)
            }
            Ok(status) => changes.extend(status),
            Err(e) => error!(
                "Error in process message of device {}, msg = {}: {}",
                self.info.device_id,
                hex::encode(envelope),
                e
            ),
        }
    }

    fn close_socket(&mut self) {
        let was_ready = self.state == SessionState::Ready;
        self.state = SessionState::Closing;
        if self.stream.take().is_some() {
            debug!("Closed socket to device {}", self.info.device_id);
        }
        self.buffer.clear();
        self.unsupported.clear();
        self.state = SessionState::Disconnected;

        if was_ready {
            self.shared.set_available(false);
        }
    }

    fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((self.info.ip, self.info.port))
    }
}

/// Read one chunk; an empty read means the peer closed the connection
async fn read_chunk(
    stream: Option<&mut Box<dyn DeviceStream>>,
    size: usize,
    timeout: Duration,
) -> Result<Vec<u8>, SessionError> {
    let stream = stream.ok_or(SessionError::NotConnected)?;
    let mut chunk = vec![0u8; size];
    let read = tokio::time::timeout(timeout, stream.read(&mut chunk))
        .await
        .map_err(|_| SessionError::Timeout("read"))??;
    if read == 0 {
        return Err(SessionError::ConnectionClosed);
    }
    chunk.truncate(read);
    Ok(chunk)
}
