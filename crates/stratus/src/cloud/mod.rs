// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Public cloud client and connection supervisor.
//!
//! [`Cloud`] is the host-facing surface: register functions, variables and
//! subscriptions, connect, then call [`Cloud::run_loop`] periodically
//! (every 20 ms or so). The supervisor drives reconnection with backoff,
//! the Hello/Describe sequencing, the post-handshake state broadcast, the
//! periodic health check, and the system event subscription that carries
//! update flags, the owner list and remote reset.

mod supervisor;

pub use supervisor::ReconnectBackoff;

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{
    ConnectionProperties, ConnectionType, BROKER_HOST_SUFFIX, BROKER_PORT, CLAIM_CODE_LEN,
    DEFAULT_TTL, DEVICE_ID_LEN, DIAGNOSTIC_REFRESH_MS, PUBLISH_COUNTER_MAX, PUBLISH_PREFIX_MAX,
    PUBLISH_PREFIX_SCALE,
};
use crate::dtls::{Credentials, DtlsChannel, NoSessionStore, SessionStore};
use crate::protocol::ack::CompletionHandler;
use crate::protocol::chunked::FirmwareSink;
use crate::protocol::publisher::SYSTEM_EVENT_PREFIX;
use crate::protocol::{
    BeginOutcome, DiagnosticCloud, DiagnosticNetwork, DiagnosticSystem, Error, EventFlags,
    EventScope, EventType, FunctionPermission, HostCallbacks, KeepAliveSource, Platform,
    Protocol, ProtocolStatus, Result, VariableKind, VariableValue, DESCRIBE_METRICS,
};
use crate::transport::Transport;
use crate::coap::ReliableChannel;

#[cfg(feature = "udp-transport")]
use crate::transport::UdpTransport;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session; reconnecting when enabled.
    Disconnected,
    /// Transport connected, DTLS establishing.
    Connecting,
    /// Secure channel up, Hello exchange running.
    Established,
    /// Fully connected; application traffic flows.
    Ready,
}

/// Status-change notification to the host.
pub type ConnectionEvent = ConnectionStatus;

/// State written by the system event subscription, drained by the
/// supervisor on the next loop pass.
#[derive(Default)]
struct SystemEventState {
    updates_pending: Option<bool>,
    updates_forced: Option<bool>,
    owners: Option<Vec<String>>,
    reboot: Option<String>,
    /// Events to echo back as private publishes.
    echo: Vec<(String, String)>,
}

/// Wall-clock-ish default platform for std hosts.
///
/// Millis from a monotonic [`std::time::Instant`]; random words from a
/// xorshift seeded by the hasher RandomState (per-process OS entropy).
/// Production devices should supply their own [`Platform`] with a real RNG.
pub struct StdPlatform {
    start: std::time::Instant,
    rng_state: u64,
}

impl StdPlatform {
    #[must_use]
    pub fn new() -> Self {
        use std::hash::{BuildHasher, Hasher};
        let seed = std::collections::hash_map::RandomState::new()
            .build_hasher()
            .finish();
        Self {
            start: std::time::Instant::now(),
            rng_state: seed | 1,
        }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for StdPlatform {
    fn millis(&mut self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state >> 16) as u32
    }
}

/// The cloud client.
pub struct Cloud<T: Transport> {
    protocol: Protocol<T>,
    status: ConnectionStatus,
    connect_to_cloud: bool,
    backoff: ReconnectBackoff,
    broker_host: String,
    broker_port: u16,

    claim_code: Option<String>,
    updates_enabled: bool,
    updates_forced: bool,
    updates_pending: bool,

    health_check_interval_ms: u64,
    last_health_check: u64,
    last_diag_refresh: u64,
    started_at: u64,

    publish_counter: u32,
    publish_prefix: u32,

    status_callback: Option<Box<dyn FnMut(ConnectionStatus)>>,
    system_state: Rc<RefCell<SystemEventState>>,
}

#[cfg(feature = "udp-transport")]
impl Cloud<UdpTransport> {
    /// Builder with the default UDP transport.
    #[must_use]
    pub fn builder() -> CloudBuilder<UdpTransport> {
        CloudBuilder::with_transport(UdpTransport::new())
    }
}

impl<T: Transport> Cloud<T> {
    // ===================================================================
    // Registration surface
    // ===================================================================

    /// Register a cloud-callable function.
    pub fn function(
        &mut self,
        key: &str,
        handler: impl FnMut(&str) -> i32 + 'static,
        permission: FunctionPermission,
    ) -> bool {
        self.protocol
            .functions
            .add(key, Box::new(handler), permission)
    }

    /// Register a cloud-readable variable.
    pub fn variable(
        &mut self,
        key: &str,
        kind: VariableKind,
        accessor: impl FnMut(&str) -> VariableValue + 'static,
    ) -> bool {
        self.protocol.variables.add(key, kind, Box::new(accessor))
    }

    /// Subscribe to events matching a name prefix.
    pub fn subscribe(
        &mut self,
        filter: &str,
        handler: impl FnMut(&str, &[u8]) + 'static,
        scope: EventScope,
        device_id: Option<[u8; DEVICE_ID_LEN]>,
    ) -> bool {
        let added = self
            .protocol
            .subscriptions
            .add(filter, Box::new(handler), scope, device_id);
        if added && self.status == ConnectionStatus::Ready {
            // Late subscriptions are announced immediately.
            let _ = self.protocol.announce_subscription(filter, scope, device_id);
        }
        added
    }

    /// Remove every subscription.
    pub fn unsubscribe(&mut self) {
        self.protocol.subscriptions.remove_all();
    }

    // ===================================================================
    // Publishing
    // ===================================================================

    /// Publish an event with full control over TTL, visibility and
    /// acknowledgement.
    pub fn publish(
        &mut self,
        event_name: &str,
        data: &[u8],
        ttl: u32,
        event_type: EventType,
        flags: EventFlags,
    ) -> Result<u32> {
        self.publish_inner(event_name, data, ttl, event_type, flags, None)
    }

    /// Publish with a completion callback fired when the outcome is known.
    pub fn publish_with_completion(
        &mut self,
        event_name: &str,
        data: &[u8],
        ttl: u32,
        event_type: EventType,
        flags: EventFlags,
        completion: impl FnOnce(Result<()>) + 'static,
    ) -> Result<u32> {
        self.publish_inner(
            event_name,
            data,
            ttl,
            event_type,
            flags,
            Some(Box::new(completion)),
        )
    }

    /// Publish a public fire-and-forget event with the default TTL.
    pub fn publish_simple(&mut self, event_name: &str) -> Result<u32> {
        self.publish(
            event_name,
            &[],
            DEFAULT_TTL,
            EventType::Public,
            EventFlags::NO_ACK,
        )
    }

    /// Publish the device state document (`<prefix>/p`).
    pub fn sync_state(&mut self, data: &[u8]) -> Result<u32> {
        let event = format!("{}/p", SYSTEM_EVENT_PREFIX);
        self.publish(&event, data, DEFAULT_TTL, EventType::Public, EventFlags::NO_ACK)
    }

    fn publish_inner(
        &mut self,
        event_name: &str,
        data: &[u8],
        ttl: u32,
        event_type: EventType,
        flags: EventFlags,
        completion: Option<CompletionHandler>,
    ) -> Result<u32> {
        let publish_id = self.next_publish_id();
        let connected = self.status == ConnectionStatus::Ready;
        self.protocol.notify_send_publish(event_name, data, connected);
        if !connected {
            log::debug!("[cloud] publish \"{}\" dropped while offline", event_name);
            return Err(Error::InvalidState);
        }
        self.protocol
            .send_event(event_name, data, ttl, event_type, flags, completion)?;
        Ok(publish_id)
    }

    /// Publish ids: `prefix * 10^7 + counter` with a random prefix drawn
    /// once, so ids stay unique across reboots without persistent state.
    fn next_publish_id(&mut self) -> u32 {
        if self.publish_prefix == 0 {
            // Rejection-sample an unbiased prefix in [1, 199].
            let top = PUBLISH_PREFIX_MAX;
            let accept_below = u32::MAX / top * top;
            for _ in 0..20 {
                let r = self.protocol.random();
                if r < accept_below {
                    self.publish_prefix = (r % top) + 1;
                    break;
                }
            }
            if self.publish_prefix == 0 {
                log::warn!("[cloud] could not draw a publish prefix; using 0");
                self.publish_prefix = u32::MAX;
            }
        }
        let prefix = if self.publish_prefix == u32::MAX {
            0
        } else {
            self.publish_prefix
        };
        self.publish_counter += 1;
        if self.publish_counter >= PUBLISH_COUNTER_MAX {
            self.publish_counter = 0;
        }
        prefix * PUBLISH_PREFIX_SCALE + self.publish_counter
    }

    // ===================================================================
    // Connection lifecycle
    // ===================================================================

    /// Begin connecting; the session is driven by [`Cloud::run_loop`].
    pub fn connect(&mut self) -> Result<()> {
        self.connect_to_cloud = true;
        if self.status == ConnectionStatus::Ready {
            return Ok(());
        }
        self.attempt_connect()
    }

    fn attempt_connect(&mut self) -> Result<()> {
        log::info!("[cloud] connecting to {}:{}", self.broker_host, self.broker_port);
        self.diagnose_attempt();
        let host = self.broker_host.clone();
        let port = self.broker_port;
        let connected = self
            .protocol
            .channel_mut()
            .inner_mut()
            .transport_mut()
            .connect(&host, port);
        if !connected {
            log::warn!("[cloud] transport connect failed");
            self.schedule_reconnect(Error::Io);
            return Err(Error::Io);
        }
        self.set_status(ConnectionStatus::Connecting);
        Ok(())
    }

    fn diagnose_attempt(&mut self) {
        self.protocol
            .diagnostics
            .cloud(DiagnosticCloud::ConnectionAttempts, 1.0);
    }

    /// Tear the session down and stop reconnecting.
    pub fn disconnect(&mut self) {
        log::info!("[cloud] disconnect requested");
        self.connect_to_cloud = false;
        self.protocol.cancel_all();
        self.protocol
            .channel_mut()
            .inner_mut()
            .transport_mut()
            .disconnect();
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Drain in-flight confirmables (bounded), then disconnect.
    pub fn sleep(&mut self, drain_timeout_ms: u32) {
        if self.status == ConnectionStatus::Ready {
            let _ = self.protocol.wait_confirmable(drain_timeout_ms);
        }
        self.disconnect();
    }

    /// True when the session is fully up.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }

    /// Current supervisor status.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    /// One cooperative pass; call every ~20 ms.
    pub fn run_loop(&mut self) {
        let now = self.protocol.now();

        // Periodic uptime and memory refresh.
        if now.saturating_sub(self.last_diag_refresh) > u64::from(DIAGNOSTIC_REFRESH_MS) {
            let uptime = now.saturating_sub(self.started_at) / 1_000;
            self.protocol
                .diagnostics
                .system(DiagnosticSystem::Uptime, uptime as f64);
            if let Some(used) = self.protocol.sample_used_memory() {
                self.protocol
                    .diagnostics
                    .system(DiagnosticSystem::UsedRam, f64::from(used));
            }
            self.last_diag_refresh = now;
        }

        match self.status {
            ConnectionStatus::Ready => {
                if let Err(err) = self.protocol.event_loop() {
                    self.connection_error(err);
                    return;
                }
                self.drain_system_state();
                self.health_check(now);
            }
            ConnectionStatus::Connecting | ConnectionStatus::Established => {
                match self.protocol.begin() {
                    Ok(BeginOutcome::InProgress) => {
                        // Track the Established sub-state for observers.
                        let up = !matches!(
                            self.protocol.bring_up_status(),
                            ProtocolStatus::ChannelInit | ProtocolStatus::ChannelEstablished
                        );
                        if up && self.status == ConnectionStatus::Connecting {
                            self.set_status(ConnectionStatus::Established);
                        }
                    }
                    Ok(BeginOutcome::Established { resumed }) => {
                        self.finish_connection(resumed);
                    }
                    Err(err) => self.connection_error(err),
                }
            }
            ConnectionStatus::Disconnected => {
                if self.connect_to_cloud && self.backoff.due(now) {
                    let _ = self.attempt_connect();
                }
            }
        }
    }

    /// Post-handshake broadcast and Ready transition.
    fn finish_connection(&mut self, resumed: bool) {
        if resumed {
            log::info!("[cloud] connected from existing session");
        } else {
            log::info!("[cloud] protocol begun successfully");
            let forced = if self.updates_forced { "true" } else { "false" };
            let enabled = if self.updates_enabled { "true" } else { "false" };
            let _ = self.publish_system("device/updates/forced", forced.as_bytes());
            let _ = self.publish_system("device/updates/enabled", enabled.as_bytes());
            if let Some(code) = self.claim_code.clone() {
                let _ = self.publish_system("device/claim/code", code.as_bytes());
                log::debug!("[cloud] claim code sent");
            }
            let _ = self.protocol.send_subscriptions();
            let _ = self.protocol.send_time_request();
        }
        self.backoff.on_success();
        self.last_health_check = self.protocol.now();
        self.set_status(ConnectionStatus::Ready);
    }

    fn publish_system(&mut self, suffix: &str, data: &[u8]) -> Result<()> {
        let event = format!("{}/{}", SYSTEM_EVENT_PREFIX, suffix);
        self.protocol.send_event(
            &event,
            data,
            DEFAULT_TTL,
            EventType::Private,
            EventFlags::NO_ACK,
            None,
        )
    }

    fn health_check(&mut self, now: u64) {
        if self.health_check_interval_ms == 0 {
            return;
        }
        if now.saturating_sub(self.last_health_check) > self.health_check_interval_ms {
            self.last_health_check = now;
            log::trace!("[cloud] sending health check");
            let _ = self.protocol.post_description(DESCRIBE_METRICS);
        }
    }

    /// Force a health-check describe now.
    pub fn publish_health_check(&mut self) -> Result<()> {
        self.protocol.post_description(DESCRIBE_METRICS)
    }

    fn connection_error(&mut self, err: Error) {
        log::error!("[cloud] connection error: {}", err);
        self.protocol
            .diagnostics
            .cloud(DiagnosticCloud::Disconnects, 1.0);
        self.protocol.diagnostics.cloud(
            DiagnosticCloud::DisconnectionReason,
            f64::from(disconnect_reason(err)),
        );
        self.protocol.cancel_all();
        self.protocol
            .channel_mut()
            .inner_mut()
            .transport_mut()
            .disconnect();
        self.schedule_reconnect(err);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn schedule_reconnect(&mut self, _err: Error) {
        let now = self.protocol.now();
        let jitter = self.protocol.random();
        self.backoff.schedule(now, jitter);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if status != self.status {
            log::debug!("[cloud] status {:?} -> {:?}", self.status, status);
            self.status = status;
            if let Some(callback) = self.status_callback.as_mut() {
                callback(status);
            }
        }
    }

    /// Drain what the system subscription recorded during dispatch.
    fn drain_system_state(&mut self) {
        let drained = {
            let mut state = self.system_state.borrow_mut();
            std::mem::take(&mut *state)
        };
        if let Some(pending) = drained.updates_pending {
            self.updates_pending = pending;
        }
        if let Some(forced) = drained.updates_forced {
            self.updates_forced = forced;
        }
        if let Some(owners) = drained.owners {
            self.protocol.set_owners(owners);
        }
        for (name, data) in drained.echo {
            let _ = self.publish(
                &name,
                data.as_bytes(),
                DEFAULT_TTL,
                EventType::Private,
                EventFlags::NO_ACK,
            );
        }
        if let Some(arg) = drained.reboot {
            log::info!("[cloud] remote reset requested");
            self.protocol.invoke_reboot(&arg);
        }
    }

    // ===================================================================
    // Host configuration surface
    // ===================================================================

    /// Ask the broker for its time.
    pub fn get_time(&mut self) -> Result<()> {
        if self.status != ConnectionStatus::Ready {
            return Err(Error::InvalidState);
        }
        self.protocol.send_time_request()
    }

    /// Send an immediate keepalive ping.
    pub fn force_ping(&mut self) -> Result<()> {
        if self.status != ConnectionStatus::Ready {
            return Err(Error::InvalidState);
        }
        log::info!("[cloud] forcing a cloud ping");
        self.protocol.ping()
    }

    /// Send the 1-byte NAT-keepalive padding datagram.
    ///
    /// Cheaper than a CoAP ping: the broker discards it without a reply,
    /// but it keeps the NAT binding warm between real exchanges.
    pub fn send_keepalive_padding(&mut self) -> Result<()> {
        if self.status != ConnectionStatus::Ready {
            return Err(Error::InvalidState);
        }
        let padding = crate::coap::codec::keep_alive();
        match self
            .protocol
            .channel_mut()
            .inner_mut()
            .transport_mut()
            .send(&padding)
        {
            crate::transport::TransportStatus::Fatal => Err(Error::Io),
            _ => Ok(()),
        }
    }

    /// Override the keepalive interval (seconds, capped).
    pub fn set_ping_interval(&mut self, interval_s: u32) {
        let capped = (u64::from(interval_s) * 1_000)
            .min(u64::from(ConnectionProperties::PING_INTERVAL_CAP_MS));
        self.protocol
            .pinger_mut()
            .set_interval(capped, KeepAliveSource::User);
    }

    /// Periodic metrics describe interval (0 disables; milliseconds).
    pub fn set_publish_health_check_interval(&mut self, interval_ms: u64) {
        self.health_check_interval_ms = interval_ms;
    }

    /// Claim code published right after connection.
    pub fn set_claim_code(&mut self, code: &str) {
        let mut code = code.to_string();
        code.truncate(CLAIM_CODE_LEN);
        self.claim_code = Some(code);
    }

    /// Allow firmware updates again, announcing the change when connected.
    pub fn enable_updates(&mut self) {
        self.updates_enabled = true;
        self.protocol.set_updates_enabled(true);
        if self.connected() {
            let _ = self.publish_system("device/updates/enabled", b"true");
        }
    }

    /// Refuse non-forced firmware updates, announcing the change when
    /// connected.
    pub fn disable_updates(&mut self) {
        self.updates_enabled = false;
        self.protocol.set_updates_enabled(false);
        if self.connected() {
            let _ = self.publish_system("device/updates/enabled", b"false");
        }
    }

    /// Host-visible update flags.
    #[must_use]
    pub fn updates_enabled(&self) -> bool {
        self.updates_enabled
    }

    #[must_use]
    pub fn updates_pending(&self) -> bool {
        self.updates_pending
    }

    #[must_use]
    pub fn updates_forced(&self) -> bool {
        self.updates_forced
    }

    /// Record a system diagnostic.
    pub fn diagnostic_system(&mut self, key: DiagnosticSystem, value: f64) {
        self.protocol.diagnostics.system(key, value);
    }

    /// Record a network diagnostic.
    pub fn diagnostic_network(&mut self, key: DiagnosticNetwork, value: f64) {
        self.protocol.diagnostics.network(key, value);
    }

    /// Record a cloud diagnostic.
    pub fn diagnostic_cloud(&mut self, key: DiagnosticCloud, value: f64) {
        self.protocol.diagnostics.cloud(key, value);
    }

    /// Direct access to the protocol facade (advanced hosts, tests).
    pub fn protocol_mut(&mut self) -> &mut Protocol<T> {
        &mut self.protocol
    }
}

/// Map an error to the wire disconnect-reason code.
fn disconnect_reason(err: Error) -> i32 {
    match err {
        Error::Timeout => 1,
        Error::Io => 2,
        Error::Protocol => 3,
        Error::SessionDiscarded => 4,
        _ => 7,
    }
}

/// Builder for [`Cloud`].
pub struct CloudBuilder<T: Transport> {
    transport: T,
    device_id: Option<[u8; DEVICE_ID_LEN]>,
    private_key: Vec<u8>,
    server_public_key: Vec<u8>,
    connection_type: ConnectionType,
    ping_interval_override_s: Option<u32>,
    platform: Option<Box<dyn Platform>>,
    session_store: Option<Box<dyn SessionStore>>,
    firmware: Option<Box<dyn FirmwareSink>>,
    callbacks: HostCallbacks,
    status_callback: Option<Box<dyn FnMut(ConnectionStatus)>>,
    claim_code: Option<String>,
    product_id: u16,
    firmware_version: u16,
    platform_id: u16,
    ota_upgrade_successful: bool,
    broker_host_override: Option<String>,
    broker_port: u16,
}

impl<T: Transport> CloudBuilder<T> {
    /// Builder over a host-supplied transport.
    #[must_use]
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            device_id: None,
            private_key: Vec::new(),
            server_public_key: Vec::new(),
            connection_type: ConnectionType::WiFi,
            ping_interval_override_s: None,
            platform: None,
            session_store: None,
            firmware: None,
            callbacks: HostCallbacks::default(),
            status_callback: None,
            claim_code: None,
            product_id: 0,
            firmware_version: 0,
            platform_id: 0,
            ota_upgrade_successful: false,
            broker_host_override: None,
            broker_port: BROKER_PORT,
        }
    }

    #[must_use]
    pub fn device_id(mut self, device_id: [u8; DEVICE_ID_LEN]) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Device private key, SEC1 `ECPrivateKey` DER.
    #[must_use]
    pub fn private_key(mut self, der: &[u8]) -> Self {
        self.private_key = der.to_vec();
        self
    }

    /// Pinned broker public key, `SubjectPublicKeyInfo` DER.
    #[must_use]
    pub fn server_public_key(mut self, der: &[u8]) -> Self {
        self.server_public_key = der.to_vec();
        self
    }

    /// Link type, selecting the timeout profile.
    #[must_use]
    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Keepalive interval override in seconds.
    #[must_use]
    pub fn ping_interval(mut self, interval_s: u32) -> Self {
        self.ping_interval_override_s = Some(interval_s);
        self
    }

    /// Monotonic clock and RNG source.
    #[must_use]
    pub fn platform(mut self, platform: impl Platform + 'static) -> Self {
        self.platform = Some(Box::new(platform));
        self
    }

    /// DTLS session persistence.
    #[must_use]
    pub fn session_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.session_store = Some(Box::new(store));
        self
    }

    /// Firmware chunk persistence, enabling OTA.
    #[must_use]
    pub fn firmware_sink(mut self, sink: impl FirmwareSink + 'static) -> Self {
        self.firmware = Some(Box::new(sink));
        self
    }

    #[must_use]
    pub fn on_signal(mut self, callback: impl FnMut(bool) + 'static) -> Self {
        self.callbacks.signal = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_set_time(mut self, callback: impl FnMut(u32) + 'static) -> Self {
        self.callbacks.set_time = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_reboot(mut self, callback: impl FnMut(&str) + 'static) -> Self {
        self.callbacks.reboot = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_send_publish(mut self, callback: impl FnMut(&str, &[u8], bool) + 'static) -> Self {
        self.callbacks.send_publish = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_property_update(
        mut self,
        callback: impl FnMut(&str, &str, bool) -> i32 + 'static,
    ) -> Self {
        self.callbacks.property_update = Some(Box::new(callback));
        self
    }

    /// Extra system info merged into the describe document.
    #[must_use]
    pub fn system_info(mut self, callback: impl FnMut() -> String + 'static) -> Self {
        self.callbacks.system_info = Some(Box::new(callback));
        self
    }

    /// Used-memory sampler for the periodic diagnostics refresh.
    #[must_use]
    pub fn used_memory_sampler(mut self, sampler: impl FnMut() -> u32 + 'static) -> Self {
        self.callbacks.used_memory = Some(Box::new(sampler));
        self
    }

    #[must_use]
    pub fn on_connection_status(
        mut self,
        callback: impl FnMut(ConnectionStatus) + 'static,
    ) -> Self {
        self.status_callback = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn claim_code(mut self, code: &str) -> Self {
        let mut code = code.to_string();
        code.truncate(CLAIM_CODE_LEN);
        self.claim_code = Some(code);
        self
    }

    #[must_use]
    pub fn product_id(mut self, product_id: u16) -> Self {
        self.product_id = product_id;
        self
    }

    #[must_use]
    pub fn firmware_version(mut self, version: u16) -> Self {
        self.firmware_version = version;
        self
    }

    #[must_use]
    pub fn platform_id(mut self, platform_id: u16) -> Self {
        self.platform_id = platform_id;
        self
    }

    /// Report the previous OTA as successful in the Hello flags.
    #[must_use]
    pub fn ota_upgrade_successful(mut self, successful: bool) -> Self {
        self.ota_upgrade_successful = successful;
        self
    }

    /// Override the broker endpoint (testing, private brokers).
    #[must_use]
    pub fn broker(mut self, host: &str, port: u16) -> Self {
        self.broker_host_override = Some(host.to_string());
        self.broker_port = port;
        self
    }

    /// Assemble the client.
    pub fn build(self) -> Result<Cloud<T>> {
        let device_id = self.device_id.ok_or(Error::InvalidState)?;
        let credentials = Credentials {
            device_id,
            private_key_der: self.private_key,
            server_public_der: self.server_public_key,
        };
        let properties = {
            let mut p = ConnectionProperties::for_link(self.connection_type);
            if let Some(interval_s) = self.ping_interval_override_s {
                p.ping_interval_ms = interval_s
                    .saturating_mul(1_000)
                    .min(ConnectionProperties::PING_INTERVAL_CAP_MS);
            }
            p
        };

        let session_store = self
            .session_store
            .unwrap_or_else(|| Box::new(NoSessionStore));
        let dtls = DtlsChannel::new(
            self.transport,
            &credentials,
            session_store,
            properties.handshake_timeout_ms,
        )?;
        let channel = ReliableChannel::new(dtls, properties.ack_timeout_ms);

        let platform = self
            .platform
            .unwrap_or_else(|| Box::new(StdPlatform::new()));
        let mut protocol = Protocol::new(
            channel,
            platform,
            self.callbacks,
            device_id,
            self.platform_id,
            &properties,
        );
        protocol.set_product_id(self.product_id);
        protocol.set_firmware_version(self.firmware_version);
        protocol.set_ota_upgrade_successful(self.ota_upgrade_successful);
        if let Some(firmware) = self.firmware {
            protocol.set_firmware_sink(firmware);
        }

        // The system subscription: update flags, owners, remote reset.
        let system_state: Rc<RefCell<SystemEventState>> = Rc::default();
        let state = Rc::clone(&system_state);
        protocol.subscriptions.add(
            SYSTEM_EVENT_PREFIX,
            Box::new(move |name, data| {
                handle_system_event(&state, name, data);
            }),
            EventScope::MyDevices,
            None,
        );

        let broker_host = self.broker_host_override.unwrap_or_else(|| {
            let hex: String = device_id.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{}.{}", hex, BROKER_HOST_SUFFIX)
        });

        let started_at = protocol.now();
        Ok(Cloud {
            protocol,
            status: ConnectionStatus::Disconnected,
            connect_to_cloud: false,
            backoff: ReconnectBackoff::new(),
            broker_host,
            broker_port: self.broker_port,
            claim_code: self.claim_code,
            updates_enabled: true,
            updates_forced: false,
            updates_pending: false,
            health_check_interval_ms: 0,
            last_health_check: 0,
            last_diag_refresh: 0,
            started_at,
            publish_counter: 0,
            publish_prefix: 0,
            status_callback: self.status_callback,
            system_state,
        })
    }
}

/// Interpret one system event into supervisor state.
fn handle_system_event(state: &Rc<RefCell<SystemEventState>>, name: &str, data: &[u8]) {
    let text = String::from_utf8_lossy(data).into_owned();
    log::trace!("[cloud] system event {}: {}", name, text);
    let mut state = state.borrow_mut();
    let suffix = name
        .strip_prefix(SYSTEM_EVENT_PREFIX)
        .unwrap_or(name)
        .trim_start_matches('/');
    match suffix {
        "device/updates/pending" => {
            state.updates_pending = Some(text == "true");
            state.echo.push((name.to_string(), text));
        }
        "device/updates/forced" => {
            state.updates_forced = Some(text == "true");
            state.echo.push((name.to_string(), text));
        }
        "device/owners" => {
            let owners = text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            state.owners = Some(owners);
        }
        "device/reset" => {
            state.reboot = Some(text);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{codec, CoapType, Message};
    use crate::dtls::testsrv::TestBroker;
    use crate::transport::TransportStatus;
    use std::collections::VecDeque;

    /// Platform with a controllable clock and deterministic RNG.
    struct TestPlatform {
        t: Rc<RefCell<u64>>,
        seed: u32,
    }

    impl Platform for TestPlatform {
        fn millis(&mut self) -> u64 {
            let mut t = self.t.borrow_mut();
            *t += 1;
            *t
        }
        fn random_u32(&mut self) -> u32 {
            self.seed ^= self.seed << 13;
            self.seed ^= self.seed >> 17;
            self.seed ^= self.seed << 5;
            self.seed
        }
    }

    /// Transport wired to the broker simulator; every confirmable CoAP
    /// frame the broker decrypts gets an automatic empty ACK back.
    struct AutoAckTransport {
        broker: Rc<RefCell<TestBroker>>,
        inbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
        acked: usize,
    }

    impl Transport for AutoAckTransport {
        fn connect(&mut self, _host: &str, _port: u16) -> bool {
            true
        }
        fn disconnect(&mut self) {}
        fn send(&mut self, data: &[u8]) -> TransportStatus {
            let mut broker = self.broker.borrow_mut();
            // A move-session record decrypts like application data once the
            // type byte is restored.
            let mut datagram = data.to_vec();
            if datagram.first() == Some(&0xFE) {
                datagram[0] = 23;
                datagram.truncate(datagram.len() - 13);
            }
            let responses = broker.process_datagram(&datagram);
            self.inbox.borrow_mut().extend(responses);

            // ACK any newly received confirmable.
            while self.acked < broker.received.len() {
                let frame = broker.received[self.acked].clone();
                self.acked += 1;
                let msg = Message::from_bytes(frame);
                if msg.coap_type() == Some(CoapType::Confirmable) && msg.len() >= 4 {
                    let ack = codec::empty_ack(msg.wire_id());
                    let sealed = broker.seal_application(&ack);
                    self.inbox.borrow_mut().push_back(sealed);
                }
            }
            TransportStatus::Done(data.len())
        }
        fn receive(&mut self, buf: &mut [u8]) -> TransportStatus {
            match self.inbox.borrow_mut().pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    TransportStatus::Done(datagram.len())
                }
                None => TransportStatus::Idle,
            }
        }
    }

    struct CloudHarness {
        cloud: Cloud<AutoAckTransport>,
        broker: Rc<RefCell<TestBroker>>,
        inbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
        clock: Rc<RefCell<u64>>,
    }

    fn device_key_der(seed: u32) -> Vec<u8> {
        use p256::ecdsa::SigningKey;
        let mut platform = TestPlatform {
            t: Rc::new(RefCell::new(0)),
            seed,
        };
        let scalar = crate::dtls::crypto::random_scalar(&mut platform).expect("scalar");
        let signing = SigningKey::from_bytes(&scalar.to_bytes()).expect("key");
        let point = signing.verifying_key().to_encoded_point(false);
        let mut body = vec![0x02, 0x01, 0x01, 0x04, 0x20];
        body.extend_from_slice(&signing.to_bytes());
        body.push(0xA1);
        body.push(68);
        body.extend_from_slice(&[0x03, 0x42, 0x00, 0x04]);
        body.extend_from_slice(&point.as_bytes()[1..]);
        let mut der = vec![0x30, body.len() as u8];
        der.extend_from_slice(&body);
        der
    }

    fn harness(seed: u64) -> CloudHarness {
        let broker = Rc::new(RefCell::new(TestBroker::new(seed)));
        let inbox = Rc::new(RefCell::new(VecDeque::new()));
        let clock = Rc::new(RefCell::new(0u64));
        let transport = AutoAckTransport {
            broker: Rc::clone(&broker),
            inbox: Rc::clone(&inbox),
            acked: 0,
        };
        let server_der = broker.borrow().public_key_der();
        let cloud = CloudBuilder::with_transport(transport)
            .device_id([0x42; DEVICE_ID_LEN])
            .private_key(&device_key_der(0x5EED_0000 | seed as u32))
            .server_public_key(&server_der)
            .connection_type(ConnectionType::WiFi)
            .platform(TestPlatform {
                t: Rc::clone(&clock),
                seed: 0xFACE_0FF1 ^ seed as u32,
            })
            .product_id(42)
            .firmware_version(7)
            .platform_id(103)
            .build()
            .expect("cloud builds");
        CloudHarness {
            cloud,
            broker,
            inbox,
            clock,
        }
    }

    fn pump_until_ready(harness: &mut CloudHarness) {
        harness.cloud.connect().expect("connect starts");
        for _ in 0..256 {
            harness.cloud.run_loop();
            if harness.cloud.connected() {
                return;
            }
        }
        panic!("cloud did not reach Ready");
    }

    #[test]
    fn test_connect_reaches_ready() {
        let mut harness = harness(31);
        pump_until_ready(&mut harness);
        assert_eq!(
            harness.cloud.connection_status(),
            ConnectionStatus::Ready
        );
        assert!(harness.broker.borrow().is_established());

        // The broker saw the Hello first: POST h with our product data.
        let broker = harness.broker.borrow();
        let hello = &broker.received[0];
        assert_eq!(codec::decode_type(hello), codec::CoapMessageType::Hello);
        // product_id=42, firmware=7, platform=103 after the payload marker.
        let marker = hello.iter().position(|&b| b == 0xFF).expect("payload");
        assert_eq!(&hello[marker + 1..marker + 5], &[0x00, 0x2A, 0x00, 0x07]);
    }

    #[test]
    fn test_post_handshake_broadcast_order() {
        let mut harness = harness(37);
        harness.cloud.set_claim_code("CLM-0001");
        pump_until_ready(&mut harness);

        let broker = harness.broker.borrow();
        let names: Vec<String> = broker
            .received
            .iter()
            .filter_map(|frame| {
                let msg = Message::from_bytes(frame.clone());
                codec::decode_event(&msg).map(|e| e.name)
            })
            .collect();
        // Spec order: forced, enabled, claim code.
        let forced = names
            .iter()
            .position(|n| n.ends_with("updates/forced"))
            .expect("forced sent");
        let enabled = names
            .iter()
            .position(|n| n.ends_with("updates/enabled"))
            .expect("enabled sent");
        let claim = names
            .iter()
            .position(|n| n.ends_with("claim/code"))
            .expect("claim sent");
        assert!(forced < enabled && enabled < claim);

        // Subscriptions (GET e) and time request (GET t) followed.
        let has_subscription = broker
            .received
            .iter()
            .any(|f| f.get(1) == Some(&0x01) && f.get(5) == Some(&b'e'));
        let has_time = broker
            .received
            .iter()
            .any(|f| f.get(1) == Some(&0x01) && f.get(6) == Some(&b't'));
        assert!(has_subscription, "subscriptions announced");
        assert!(has_time, "time requested");
    }

    #[test]
    fn test_publish_roundtrip_and_ids() {
        let mut harness = harness(41);
        pump_until_ready(&mut harness);

        let id_a = harness
            .cloud
            .publish(
                "sensors/temp",
                b"21.5",
                60,
                EventType::Private,
                EventFlags::NO_ACK,
            )
            .expect("publish");
        // Space publishes out to dodge the rate limiter.
        *harness.clock.borrow_mut() += 2_000;
        let id_b = harness
            .cloud
            .publish(
                "sensors/temp",
                b"21.6",
                60,
                EventType::Private,
                EventFlags::NO_ACK,
            )
            .expect("publish");

        // Publish ids share the prefix and increment.
        assert_eq!(id_b, id_a + 1);
        let prefix = id_a / PUBLISH_PREFIX_SCALE;
        assert!((1..=PUBLISH_PREFIX_MAX).contains(&prefix));
        assert_eq!(id_a % PUBLISH_PREFIX_SCALE, 1);

        let broker = harness.broker.borrow();
        let seen: Vec<_> = broker
            .received
            .iter()
            .filter_map(|frame| {
                let msg = Message::from_bytes(frame.clone());
                codec::decode_event(&msg)
            })
            .filter(|e| e.name == "sensors/temp")
            .collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].data, b"21.5");
    }

    #[test]
    fn test_rate_limit_fifth_publish_rejected() {
        let mut harness = harness(43);
        pump_until_ready(&mut harness);

        let broker_count_before = harness.broker.borrow().received.len();
        // 5 publishes within 800 "ms" of loop clock.
        let mut results = Vec::new();
        for i in 0..5 {
            results.push(harness.cloud.publish(
                &format!("burst/{}", i),
                b"x",
                60,
                EventType::Public,
                EventFlags::NO_ACK,
            ));
        }
        assert!(results[..4].iter().all(Result::is_ok));
        assert_eq!(results[4], Err(Error::BandwidthExceeded));

        // The fifth never hit the wire.
        let events_on_wire = harness.broker.borrow().received[broker_count_before..]
            .iter()
            .filter(|f| {
                codec::decode_type(f) == codec::CoapMessageType::Event
            })
            .count();
        assert_eq!(events_on_wire, 4);
    }

    #[test]
    fn test_publish_while_offline_fails() {
        let mut harness = harness(47);
        assert_eq!(
            harness
                .cloud
                .publish("e", b"", 60, EventType::Public, EventFlags::NO_ACK)
                .err(),
            Some(Error::InvalidState)
        );
    }

    #[test]
    fn test_function_call_end_to_end() {
        let mut harness = harness(53);
        harness
            .cloud
            .function("double", |arg| arg.parse::<i32>().unwrap_or(0) * 2, FunctionPermission::AllUsers);
        pump_until_ready(&mut harness);

        // Broker calls the function: POST f/double with payload "21".
        let mut frame = vec![0x41, 0x02, 0x30, 0x39, 0x07, 0xB1, b'f'];
        frame.push(6);
        frame.extend_from_slice(b"double");
        frame.push(0xFF);
        frame.extend_from_slice(b"21");
        let sealed = harness.broker.borrow_mut().seal_application(&frame);
        harness.inbox.borrow_mut().push_back(sealed);

        for _ in 0..8 {
            harness.cloud.run_loop();
        }
        let broker = harness.broker.borrow();
        let response = broker
            .received
            .iter()
            .find(|f| f.len() == 10 && f[1] == 0x44 && f[4] == 0x07)
            .expect("function response sent");
        assert_eq!(&response[..6], &[0x61, 0x44, 0x30, 0x39, 0x07, 0xFF]);
        assert_eq!(&response[6..], &42i32.to_be_bytes());
    }

    #[test]
    fn test_system_event_updates_flags() {
        let mut harness = harness(59);
        pump_until_ready(&mut harness);
        assert!(!harness.cloud.updates_pending());

        let frame = codec::event(
            0x0101,
            0,
            "trackle/device/updates/pending",
            b"true",
            60,
            0,
            1,
            EventType::Private,
            false,
        );
        let sealed = harness.broker.borrow_mut().seal_application(&frame);
        harness.inbox.borrow_mut().push_back(sealed);

        for _ in 0..8 {
            harness.cloud.run_loop();
        }
        assert!(harness.cloud.updates_pending());
    }

    #[test]
    fn test_disconnect_cancels_and_stops() {
        let mut harness = harness(61);
        pump_until_ready(&mut harness);
        harness.cloud.disconnect();
        assert_eq!(
            harness.cloud.connection_status(),
            ConnectionStatus::Disconnected
        );
        // No reconnect attempts while disabled.
        for _ in 0..64 {
            harness.cloud.run_loop();
        }
        assert_eq!(
            harness.cloud.connection_status(),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_describe_after_hello_includes_registrations() {
        let mut harness = harness(67);
        harness
            .cloud
            .function("reset_counter", |_| 0, FunctionPermission::AllUsers);
        harness.cloud.variable("temp", VariableKind::Double, |_| {
            VariableValue::Double(21.5)
        });
        pump_until_ready(&mut harness);

        let broker = harness.broker.borrow();
        let describe = broker
            .received
            .iter()
            .find(|f| f.get(1) == Some(&0x02) && f.get(5) == Some(&b'd'))
            .expect("describe posted");
        let marker = describe.iter().position(|&b| b == 0xFF).expect("payload");
        let body = String::from_utf8_lossy(&describe[marker + 1..]);
        assert!(body.contains("\"f\":[\"reset_counter\"]"), "body: {}", body);
        assert!(body.contains("\"temp\":9"), "body: {}", body);
    }
}
