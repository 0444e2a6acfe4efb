//! TxRx Manager — device lifecycle state machine
//!
//! One tokio task owns every [`Device`] and the scan state. Caller operations, transport
//! events and watchdog expiries all arrive on channels into that task, so state is only ever
//! mutated from one place. Callers talk to it through a cloneable [`ManagerHandle`]: each
//! operation resolves as soon as its preconditions are checked and the transport call is
//! issued, and the eventual outcome is reported through the delegate.

use crate::config::{ManagerConfig, TimeoutConfig};
use crate::delegate::{Dispatcher, Notification, TxRxDelegate};
use crate::device::{ConnectionStatus, Device, DeviceInfo, TransferStatus, UNNAMED_DEVICE};
use crate::error::{TransportError, TxRxError};
use crate::profile::DeviceProfile;
use crate::transport::{Transport, TransportEvent, TransportEventReceiver};
use crate::watchdog::{Phase, WatchdogExpiry, WatchdogTimer};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Reply<T> = oneshot::Sender<T>;

/// Commands that can be sent to the manager task
#[derive(Debug)]
enum Command {
    StartScan { reply: Reply<Result<(), TxRxError>> },
    StopScan { reply: Reply<Result<(), TxRxError>> },
    Connect {
        device: String,
        reply: Reply<Result<(), TxRxError>>,
    },
    Disconnect {
        device: String,
        reply: Reply<Result<(), TxRxError>>,
    },
    Send {
        device: String,
        data: Vec<u8>,
        reply: Reply<Result<(), TxRxError>>,
    },
    IsConnected {
        device: String,
        reply: Reply<Result<bool, TxRxError>>,
    },
    IsScanning { reply: Reply<bool> },
    DiscoveredDevices { reply: Reply<Vec<DeviceInfo>> },
    Device {
        device: String,
        reply: Reply<Option<DeviceInfo>>,
    },
    ConfigureTimeout {
        phase: Phase,
        millis: u64,
        reply: Reply<Result<(), TxRxError>>,
    },
    Timeouts { reply: Reply<TimeoutConfig> },
    ResetTimeouts { reply: Reply<()> },
    Shutdown { reply: Reply<()> },
}

/// Handle to communicate with the running manager task
#[derive(Clone, Debug)]
pub struct ManagerHandle {
    command_tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, TxRxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| TxRxError::Internal("Manager task not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| TxRxError::Internal("No reply from manager".to_string()))
    }

    /// Start discovering devices
    pub async fn start_scan(&self) -> Result<(), TxRxError> {
        self.request(|reply| Command::StartScan { reply }).await?
    }

    /// Stop discovering devices
    pub async fn stop_scan(&self) -> Result<(), TxRxError> {
        self.request(|reply| Command::StopScan { reply }).await?
    }

    /// Connect to a discovered device by indexed name
    pub async fn connect(&self, device: &str) -> Result<(), TxRxError> {
        let device = device.to_string();
        self.request(|reply| Command::Connect { device, reply }).await?
    }

    /// Disconnect a device by indexed name
    pub async fn disconnect(&self, device: &str) -> Result<(), TxRxError> {
        let device = device.to_string();
        self.request(|reply| Command::Disconnect { device, reply }).await?
    }

    /// Send `data` verbatim to a ready device
    pub async fn send(&self, device: &str, data: Vec<u8>) -> Result<(), TxRxError> {
        let device = device.to_string();
        self.request(|reply| Command::Send { device, data, reply }).await?
    }

    /// Whether the device's link is up
    pub async fn is_connected(&self, device: &str) -> Result<bool, TxRxError> {
        let device = device.to_string();
        self.request(|reply| Command::IsConnected { device, reply }).await?
    }

    pub async fn is_scanning(&self) -> Result<bool, TxRxError> {
        self.request(|reply| Command::IsScanning { reply }).await
    }

    /// Known devices in discovery order
    pub async fn discovered_devices(&self) -> Result<Vec<DeviceInfo>, TxRxError> {
        self.request(|reply| Command::DiscoveredDevices { reply }).await
    }

    /// Look up a device by indexed name
    pub async fn device(&self, device: &str) -> Result<Option<DeviceInfo>, TxRxError> {
        let device = device.to_string();
        self.request(|reply| Command::Device { device, reply }).await
    }

    /// Change the watchdog interval of `phase`; applies from the next arming
    pub async fn configure_timeout(&self, phase: Phase, millis: u64) -> Result<(), TxRxError> {
        self.request(|reply| Command::ConfigureTimeout {
            phase,
            millis,
            reply,
        })
        .await?
    }

    /// Watchdog interval of `phase` in milliseconds
    pub async fn timeout(&self, phase: Phase) -> Result<u64, TxRxError> {
        Ok(self.timeouts().await?.millis(phase))
    }

    pub async fn timeouts(&self) -> Result<TimeoutConfig, TxRxError> {
        self.request(|reply| Command::Timeouts { reply }).await
    }

    /// Restore the default watchdog intervals
    pub async fn reset_timeouts(&self) -> Result<(), TxRxError> {
        self.request(|reply| Command::ResetTimeouts { reply }).await
    }

    /// Disconnect everything and stop the manager task
    pub async fn shutdown(&self) -> Result<(), TxRxError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// State owned by the manager task
pub struct Manager {
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    profiles: Vec<Arc<DeviceProfile>>,
    timeouts: TimeoutConfig,
    /// Discovery order
    devices: Vec<Device>,
    scanning: bool,
    scan_watchdog: Option<WatchdogTimer>,
    /// Addresses already reported as found during the current scan
    reported: HashSet<String>,
    /// Indexed name of the device with a connect attempt in progress
    connecting: Option<String>,
    expiry_tx: mpsc::UnboundedSender<WatchdogExpiry>,
}

impl Manager {
    /// Spawn the manager task on the current runtime and return its handle
    pub fn start(
        transport: Arc<dyn Transport>,
        events: TransportEventReceiver,
        delegate: Arc<dyn TxRxDelegate>,
        config: ManagerConfig,
    ) -> Result<ManagerHandle, TxRxError> {
        config.validate()?;

        let callback_runtime = config.callback_runtime.clone().unwrap_or_else(Handle::current);
        let (dispatcher, _dispatcher_task) = Dispatcher::spawn(delegate, &callback_runtime);
        let (command_tx, command_rx) = mpsc::channel::<Command>(256);
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();

        let manager = Manager {
            transport,
            dispatcher,
            profiles: config.profiles.into_iter().map(Arc::new).collect(),
            timeouts: config.timeouts,
            devices: Vec::new(),
            scanning: false,
            scan_watchdog: None,
            reported: HashSet::new(),
            connecting: None,
            expiry_tx,
        };

        tokio::spawn(manager.run(command_rx, events, expiry_rx));
        Ok(ManagerHandle { command_tx })
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut events: TransportEventReceiver,
        mut expiry_rx: mpsc::UnboundedReceiver<WatchdogExpiry>,
    ) {
        info!("TxRx manager started");
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(expiry) = expiry_rx.recv() => self.handle_expiry(expiry),
            }
        }
        info!("TxRx manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { reply } => {
                let _ = reply.send(self.start_scan());
            }
            Command::StopScan { reply } => {
                let _ = reply.send(self.stop_scan());
            }
            Command::Connect { device, reply } => {
                let _ = reply.send(self.connect(&device));
            }
            Command::Disconnect { device, reply } => {
                let _ = reply.send(self.disconnect(&device));
            }
            Command::Send {
                device,
                data,
                reply,
            } => {
                let _ = reply.send(self.send(&device, data));
            }
            Command::IsConnected { device, reply } => {
                let result = self
                    .index_of(&device)
                    .map(|index| self.devices[index].info().is_connected());
                let _ = reply.send(result);
            }
            Command::IsScanning { reply } => {
                let _ = reply.send(self.scanning);
            }
            Command::DiscoveredDevices { reply } => {
                let _ = reply.send(self.devices.iter().map(Device::info).collect());
            }
            Command::Device { device, reply } => {
                let info = self
                    .devices
                    .iter()
                    .find(|d| d.indexed_name() == device)
                    .map(Device::info);
                let _ = reply.send(info);
            }
            Command::ConfigureTimeout {
                phase,
                millis,
                reply,
            } => {
                let result = self.timeouts.set(phase, millis);
                if result.is_ok() {
                    info!("Timeout for {} set to {} ms", phase, millis);
                }
                let _ = reply.send(result);
            }
            Command::Timeouts { reply } => {
                let _ = reply.send(self.timeouts);
            }
            Command::ResetTimeouts { reply } => {
                self.timeouts = TimeoutConfig::default();
                let _ = reply.send(());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    // ========================================================================
    // SCAN
    // ========================================================================

    fn start_scan(&mut self) -> Result<(), TxRxError> {
        if self.scanning {
            return Err(TxRxError::AlreadyScanning);
        }
        if !self.transport.is_ready() {
            return Err(TxRxError::TransportUnavailable);
        }

        let services: Vec<Uuid> = self.profiles.iter().map(|p| p.service_uuid()).collect();
        self.transport.start_scan(&services).map_err(|e| match e {
            TransportError::Unavailable => TxRxError::TransportUnavailable,
            other => TxRxError::ScanFailed(other.to_string()),
        })?;

        // Devices with a live link stay owned across scans
        self.devices
            .retain(|d| d.connection_status() != ConnectionStatus::Disconnected);
        self.reported.clear();
        self.scanning = true;
        self.scan_watchdog = Some(WatchdogTimer::schedule(
            None,
            Phase::Scan,
            self.timeouts.interval(Phase::Scan),
            self.expiry_tx.clone(),
        ));

        info!("Device scan started");
        self.notify(Notification::ScanBegan);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TxRxError> {
        if !self.scanning {
            return Err(TxRxError::ScanNotStarted);
        }
        self.finish_scan();
        Ok(())
    }

    fn finish_scan(&mut self) {
        if let Some(timer) = self.scan_watchdog.take() {
            timer.cancel();
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Transport failed to stop scanning: {}", e);
        }
        self.scanning = false;
        info!("Device scan ended, {} device(s) known", self.devices.len());
        self.notify(Notification::ScanEnded);
    }

    fn on_scan_failed(&mut self, reason: String) {
        if !self.scanning {
            debug!("Scan failure outside a scan ignored: {}", reason);
            return;
        }
        warn!("Device scan failed: {}", reason);
        self.notify(Notification::ScanError(TxRxError::ScanFailed(reason)));
        self.finish_scan();
    }

    fn on_advertisement(
        &mut self,
        address: String,
        name: Option<String>,
        services: Vec<Uuid>,
        rssi: Option<i16>,
    ) {
        if !self.scanning {
            debug!("Advertisement from {} outside a scan ignored", address);
            return;
        }
        if let Some(device) = self.devices.iter_mut().find(|d| d.address() == address) {
            device.update_advertisement(name.as_deref(), rssi);
            if self.reported.insert(address) {
                let info = device.info();
                debug!("Known device {} seen again in this scan", info.indexed_name);
                self.notify(Notification::DeviceFound(info));
            }
            return;
        }
        let Some(profile) = self.profile_for(&services) else {
            debug!("Advertisement from {} matches no profile", address);
            return;
        };

        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNNAMED_DEVICE.to_string());
        let indexed_name = self.next_indexed_name(&name);
        let device = Device::new(name, indexed_name, address, rssi, profile);
        let info = device.info();
        self.devices.push(device);
        self.reported.insert(info.address.clone());

        info!("Device found: {} ({})", info.indexed_name, info.address);
        self.notify(Notification::DeviceFound(info));
    }

    fn profile_for(&self, services: &[Uuid]) -> Option<Arc<DeviceProfile>> {
        if services.is_empty() {
            return self.profiles.first().cloned();
        }
        self.profiles.iter().find(|p| p.matches(services)).cloned()
    }

    fn next_indexed_name(&self, name: &str) -> String {
        let taken = |candidate: &str| self.devices.iter().any(|d| d.indexed_name() == candidate);
        if !taken(name) {
            return name.to_string();
        }
        (2..)
            .map(|index| format!("{}_{}", name, index))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    // ========================================================================
    // CONNECT / DISCONNECT
    // ========================================================================

    fn connect(&mut self, name: &str) -> Result<(), TxRxError> {
        let index = self.index_of(name)?;
        if self.connecting.is_some() {
            return Err(TxRxError::AlreadyConnecting);
        }
        if self.devices[index].connection_status() != ConnectionStatus::Disconnected {
            return Err(TxRxError::AlreadyConnected);
        }
        if self.scanning {
            return Err(TxRxError::ScanInProgress);
        }
        if !self.transport.is_ready() {
            return Err(TxRxError::TransportUnavailable);
        }

        let interval = self.timeouts.interval(Phase::Connect);
        let device = &mut self.devices[index];
        device.set_connection_status(ConnectionStatus::Connecting);
        device.arm_watchdog(Phase::Connect, interval, &self.expiry_tx);
        self.connecting = Some(name.to_string());
        info!("Connecting to {} ({})", name, device.address());

        if let Err(e) = self.transport.connect(device.address()) {
            self.fail_connect(index, TxRxError::ConnectFailed(e.to_string()), false);
        }
        Ok(())
    }

    fn on_connected(&mut self, index: usize) {
        let device = &mut self.devices[index];
        match device.connection_status() {
            ConnectionStatus::Connecting => {
                device.set_connection_status(ConnectionStatus::Connected);
                let info = device.info();
                debug!("{} connected, discovering services", info.indexed_name);
                self.notify(Notification::Connected(info));

                let device = &mut self.devices[index];
                device.set_connection_status(ConnectionStatus::Discovering);
                if let Err(e) = self.transport.discover(device.address()) {
                    self.fail_connect(index, TxRxError::ConnectFailed(e.to_string()), true);
                }
            }
            ConnectionStatus::Disconnected => {
                // The attempt already timed out; do not leak the link
                warn!("Late connection of {} closed", device.indexed_name());
                if let Err(e) = self.transport.disconnect(device.address()) {
                    debug!("Closing late connection failed: {}", e);
                }
            }
            status => debug!("Connected event for {} ignored in {}", device.indexed_name(), status),
        }
    }

    fn on_services_discovered(&mut self, index: usize, services: &[Uuid], characteristics: &[Uuid]) {
        let device = &self.devices[index];
        if device.connection_status() != ConnectionStatus::Discovering {
            debug!("Discovery result for {} ignored in {}", device.indexed_name(), device.connection_status());
            return;
        }

        let profile = device.profile();
        let missing: Vec<String> = [
            (services.contains(&profile.service_uuid()), profile.service_uuid()),
            (characteristics.contains(&profile.rx_uuid()), profile.rx_uuid()),
            (characteristics.contains(&profile.tx_uuid()), profile.tx_uuid()),
        ]
        .into_iter()
        .filter(|(present, _)| !present)
        .map(|(_, uuid)| uuid.to_string())
        .collect();
        if !missing.is_empty() {
            self.fail_connect(index, TxRxError::ServiceNotDiscovered(missing.join(", ")), true);
            return;
        }

        let rx_uuid = profile.rx_uuid();
        if let Err(e) = self.transport.subscribe(device.address(), rx_uuid) {
            self.fail_connect(index, TxRxError::ConnectFailed(e.to_string()), true);
            return;
        }

        let device = &mut self.devices[index];
        device.cancel_watchdog();
        device.reset_received_data();
        device.finish_send();
        device.set_connection_status(ConnectionStatus::Ready);
        let info = device.info();
        self.connecting = None;

        info!("{} ready", info.indexed_name);
        self.notify(Notification::Ready(info));
    }

    /// End a connect attempt with `error`, optionally closing the link
    fn fail_connect(&mut self, index: usize, error: TxRxError, force_disconnect: bool) {
        let device = &mut self.devices[index];
        if force_disconnect {
            if let Err(e) = self.transport.disconnect(device.address()) {
                debug!("Disconnect after failed connect of {}: {}", device.indexed_name(), e);
            }
        }
        device.reset_states();
        let info = device.info();
        if self.connecting.as_deref() == Some(info.indexed_name.as_str()) {
            self.connecting = None;
        }

        warn!("Connect to {} failed: {}", info.indexed_name, error);
        self.notify(Notification::ConnectError {
            device: info,
            error,
        });
    }

    fn disconnect(&mut self, name: &str) -> Result<(), TxRxError> {
        let index = self.index_of(name)?;
        if self.scanning {
            return Err(TxRxError::ScanInProgress);
        }
        match self.devices[index].connection_status() {
            ConnectionStatus::Disconnecting => return Err(TxRxError::AlreadyDisconnecting),
            ConnectionStatus::Disconnected => return Err(TxRxError::NotConnected),
            _ => {}
        }

        if self.connecting.as_deref() == Some(name) {
            self.connecting = None;
        }
        self.abort_send(index, TxRxError::DeviceDisconnected);

        let interval = self.timeouts.interval(Phase::Disconnect);
        let device = &mut self.devices[index];
        device.set_connection_status(ConnectionStatus::Disconnecting);
        device.arm_watchdog(Phase::Disconnect, interval, &self.expiry_tx);
        info!("Disconnecting {}", name);

        if let Err(e) = self.transport.disconnect(device.address()) {
            warn!("Transport failed to disconnect {}: {}", name, e);
            self.finish_disconnect(index);
        }
        Ok(())
    }

    fn on_disconnected(&mut self, index: usize, reason: Option<String>) {
        let status = self.devices[index].connection_status();
        match status {
            ConnectionStatus::Disconnected => {
                debug!("Duplicate disconnect of {} ignored", self.devices[index].indexed_name());
            }
            status if status.is_connecting() => {
                let reason = reason.unwrap_or_else(|| "Disconnected while connecting".to_string());
                self.fail_connect(index, TxRxError::ConnectFailed(reason), false);
            }
            ConnectionStatus::Ready => {
                info!(
                    "{} dropped the link: {}",
                    self.devices[index].indexed_name(),
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.abort_send(index, TxRxError::DeviceDisconnected);
                self.finish_disconnect(index);
            }
            _ => self.finish_disconnect(index),
        }
    }

    fn finish_disconnect(&mut self, index: usize) {
        let device = &mut self.devices[index];
        device.reset_states();
        let info = device.info();
        info!("{} disconnected", info.indexed_name);
        self.notify(Notification::Disconnected(info));
    }

    // ========================================================================
    // SEND
    // ========================================================================

    fn send(&mut self, name: &str, data: Vec<u8>) -> Result<(), TxRxError> {
        let index = self.index_of(name)?;
        if self.scanning {
            return Err(TxRxError::ScanInProgress);
        }
        let device = &mut self.devices[index];
        if device.connection_status() != ConnectionStatus::Ready {
            return Err(TxRxError::NotConnected);
        }
        // The last write of a timed out transfer is still unanswered
        if device.transfer_status() != TransferStatus::Idle || device.has_orphaned_write() {
            return Err(TxRxError::AlreadySending);
        }
        if data.is_empty() {
            return Err(TxRxError::InvalidParameters(
                "Payload must not be empty".to_string(),
            ));
        }

        let interval = self.timeouts.interval(Phase::Send);
        let device = &mut self.devices[index];
        debug!("Sending {} bytes to {}", data.len(), name);
        device.begin_send(data);
        device.arm_watchdog(Phase::Send, interval, &self.expiry_tx);
        self.write_next_chunk(index);
        Ok(())
    }

    fn write_next_chunk(&mut self, index: usize) {
        let device = &mut self.devices[index];
        let Some(chunk) = device.next_chunk() else {
            return;
        };
        let tx_uuid = device.profile().tx_uuid();
        debug!("Writing {} byte chunk to {}", chunk.len(), device.indexed_name());

        if let Err(e) = self.transport.write(device.address(), tx_uuid, &chunk) {
            self.fail_send(index, TxRxError::WriteFailed(e.to_string()));
        }
    }

    fn on_write_acknowledged(&mut self, index: usize) {
        let interval = self.timeouts.interval(Phase::Send);
        let device = &mut self.devices[index];
        if device.connection_status() != ConnectionStatus::Ready {
            debug!("Write ack for {} ignored in {}", device.indexed_name(), device.connection_status());
            return;
        }
        if device.take_orphaned_write() {
            debug!("Late write ack for {} from an abandoned transfer ignored", device.indexed_name());
            return;
        }
        let Some(acked) = device.acknowledge_chunk() else {
            debug!("Unexpected write ack for {}", device.indexed_name());
            return;
        };
        debug!(
            "{} acknowledged {} bytes ({}/{})",
            device.indexed_name(),
            acked,
            device.bytes_sent(),
            device.bytes_to_send()
        );

        if device.is_send_complete() {
            device.cancel_watchdog_for(Phase::Send);
            device.finish_send();
            let info = device.info();
            self.notify(Notification::SentData(info));
            self.arm_receive_if_partial(index);
        } else {
            device.arm_watchdog(Phase::Send, interval, &self.expiry_tx);
            self.write_next_chunk(index);
        }
    }

    /// End the transfer in progress with `error`
    fn fail_send(&mut self, index: usize, error: TxRxError) {
        let device = &mut self.devices[index];
        device.cancel_watchdog_for(Phase::Send);
        device.finish_send();
        let info = device.info();
        warn!("Send to {} failed: {}", info.indexed_name, error);
        self.notify(Notification::WriteError {
            device: info,
            error,
        });
        self.arm_receive_if_partial(index);
    }

    /// Fail a transfer that the connection is being torn down under
    fn abort_send(&mut self, index: usize, error: TxRxError) {
        let device = &mut self.devices[index];
        if device.transfer_status() == TransferStatus::Idle {
            return;
        }
        device.cancel_watchdog_for(Phase::Send);
        device.finish_send();
        let info = device.info();
        warn!("Send to {} aborted: {}", info.indexed_name, error);
        self.notify(Notification::WriteError {
            device: info,
            error,
        });
    }

    // ========================================================================
    // RECEIVE
    // ========================================================================

    fn on_notification(&mut self, index: usize, characteristic: Uuid, data: &[u8]) {
        let interval = self.timeouts.interval(Phase::Receive);
        let device = &mut self.devices[index];
        if device.connection_status() != ConnectionStatus::Ready {
            debug!("Data from {} ignored in {}", device.indexed_name(), device.connection_status());
            return;
        }
        if characteristic != device.profile().rx_uuid() {
            debug!("Data from {} on {} ignored", device.indexed_name(), characteristic);
            return;
        }

        let frames = device.append_inbound(data);
        // A send in progress owns the watchdog slot
        if device.transfer_status() == TransferStatus::Idle {
            if device.has_partial_frame() {
                device.arm_watchdog(Phase::Receive, interval, &self.expiry_tx);
            } else {
                device.cancel_watchdog_for(Phase::Receive);
            }
        }

        if frames.is_empty() {
            return;
        }
        let info = device.info();
        for frame in frames {
            debug!("{} received {} byte frame", info.indexed_name, frame.len());
            self.notify(Notification::ReceivedData {
                device: info.clone(),
                data: frame,
            });
        }
    }

    fn on_read_failed(&mut self, index: usize, reason: String) {
        let device = &mut self.devices[index];
        if device.connection_status() != ConnectionStatus::Ready {
            return;
        }
        device.cancel_watchdog_for(Phase::Receive);
        device.reset_received_data();
        let info = device.info();
        warn!("Read from {} failed: {}", info.indexed_name, reason);
        self.notify(Notification::ReadError {
            device: info,
            error: TxRxError::ReadFailed(reason),
        });
    }

    fn arm_receive_if_partial(&mut self, index: usize) {
        let interval = self.timeouts.interval(Phase::Receive);
        let device = &mut self.devices[index];
        if device.connection_status() == ConnectionStatus::Ready
            && device.transfer_status() == TransferStatus::Idle
            && device.has_partial_frame()
        {
            device.arm_watchdog(Phase::Receive, interval, &self.expiry_tx);
        }
    }

    // ========================================================================
    // EVENTS & EXPIRIES
    // ========================================================================

    fn handle_event(&mut self, event: TransportEvent) {
        debug!("Transport event: {}", event);
        match event {
            TransportEvent::StateChanged { ready } => self.on_transport_state(ready),
            TransportEvent::Advertisement {
                address,
                name,
                services,
                rssi,
            } => self.on_advertisement(address, name, services, rssi),
            TransportEvent::ScanFailed { reason } => self.on_scan_failed(reason),
            event => {
                let Some(index) = event.address().and_then(|a| self.index_by_address(a)) else {
                    debug!("Event for unknown device ignored: {}", event);
                    return;
                };
                match event {
                    TransportEvent::Connected { .. } => self.on_connected(index),
                    TransportEvent::ConnectFailed { reason, .. } => {
                        if self.devices[index].connection_status().is_connecting() {
                            self.fail_connect(index, TxRxError::ConnectFailed(reason), false);
                        }
                    }
                    TransportEvent::ServicesDiscovered {
                        services,
                        characteristics,
                        ..
                    } => self.on_services_discovered(index, &services, &characteristics),
                    TransportEvent::DiscoveryFailed { reason, .. } => {
                        if self.devices[index].connection_status() == ConnectionStatus::Discovering {
                            self.fail_connect(index, TxRxError::ServiceNotDiscovered(reason), true);
                        }
                    }
                    TransportEvent::WriteAcknowledged { .. } => self.on_write_acknowledged(index),
                    TransportEvent::WriteFailed { reason, .. } => {
                        let device = &mut self.devices[index];
                        if device.connection_status() != ConnectionStatus::Ready {
                            return;
                        }
                        if device.take_orphaned_write() {
                            debug!("Late write failure for {} ignored: {}", device.indexed_name(), reason);
                        } else if device.transfer_status() != TransferStatus::Idle {
                            self.fail_send(index, TxRxError::WriteFailed(reason));
                        }
                    }
                    TransportEvent::Notification {
                        characteristic,
                        data,
                        ..
                    } => self.on_notification(index, characteristic, &data),
                    TransportEvent::ReadFailed { reason, .. } => self.on_read_failed(index, reason),
                    TransportEvent::Disconnected { reason, .. } => self.on_disconnected(index, reason),
                    TransportEvent::StateChanged { .. }
                    | TransportEvent::Advertisement { .. }
                    | TransportEvent::ScanFailed { .. } => {}
                }
            }
        }
    }

    fn on_transport_state(&mut self, ready: bool) {
        if ready {
            info!("Transport ready");
            return;
        }
        warn!("Transport lost");

        if self.scanning {
            self.notify(Notification::ScanError(TxRxError::TransportUnavailable));
            self.finish_scan();
        }
        for index in 0..self.devices.len() {
            let status = self.devices[index].connection_status();
            if status == ConnectionStatus::Disconnected {
                continue;
            }
            if status.is_connecting() {
                self.fail_connect(index, TxRxError::TransportUnavailable, false);
                continue;
            }
            self.abort_send(index, TxRxError::DeviceDisconnected);
            let info = self.devices[index].info();
            self.notify(Notification::DeviceError {
                device: info,
                error: TxRxError::TransportUnavailable,
            });
            self.finish_disconnect(index);
        }
    }

    fn handle_expiry(&mut self, expiry: WatchdogExpiry) {
        let Some(name) = expiry.device.as_deref() else {
            self.on_scan_expired(&expiry);
            return;
        };
        let Ok(index) = self.index_of(name) else {
            debug!("Watchdog for forgotten device {} ignored", name);
            return;
        };
        if !self.devices[index].take_expired_watchdog(&expiry) {
            debug!("Stale {} watchdog for {} ignored", expiry.phase, name);
            return;
        }

        let device = &mut self.devices[index];
        let status = device.connection_status();
        let transfer = device.transfer_status();
        warn!("{} watchdog expired for {} in {}", expiry.phase, name, status);

        match expiry.phase {
            Phase::Connect if status.is_connecting() => {
                self.fail_connect(index, TxRxError::ConnectTimedOut, true);
            }
            Phase::Disconnect if status == ConnectionStatus::Disconnecting => {
                let info = device.info();
                self.notify(Notification::DeviceError {
                    device: info,
                    error: TxRxError::DisconnectTimedOut,
                });
                self.finish_disconnect(index);
            }
            Phase::Send if status == ConnectionStatus::Ready && transfer != TransferStatus::Idle => {
                device.abandon_send(self.timeouts.interval(Phase::Send));
                self.fail_send(index, TxRxError::SendTimedOut);
            }
            Phase::Receive if status == ConnectionStatus::Ready && transfer == TransferStatus::Idle => {
                if device.has_partial_frame() {
                    device.reset_received_data();
                    let info = device.info();
                    self.notify(Notification::ReadError {
                        device: info,
                        error: TxRxError::ReceiveTimedOut,
                    });
                }
            }
            phase => {
                let info = device.info();
                self.notify(Notification::DeviceInternalError {
                    device: info,
                    error: TxRxError::Internal(format!(
                        "{} watchdog expired while device was {}",
                        phase, status
                    )),
                });
            }
        }
    }

    fn on_scan_expired(&mut self, expiry: &WatchdogExpiry) {
        let current = self.scan_watchdog.as_ref().map(WatchdogTimer::id);
        if !self.scanning || current != Some(expiry.timer_id) {
            debug!("Stale scan watchdog ignored");
            return;
        }
        self.scan_watchdog = None;
        warn!("Scan watchdog expired, stopping scan");
        self.notify(Notification::ScanError(TxRxError::ScanTimedOut));
        self.finish_scan();
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn teardown(&mut self) {
        if self.scanning {
            self.finish_scan();
        }
        for index in 0..self.devices.len() {
            if self.devices[index].connection_status() == ConnectionStatus::Disconnected {
                continue;
            }
            self.abort_send(index, TxRxError::DeviceDisconnected);
            if let Err(e) = self.transport.disconnect(self.devices[index].address()) {
                debug!("Disconnect during teardown failed: {}", e);
            }
            self.finish_disconnect(index);
        }
        self.connecting = None;
    }

    fn index_of(&self, name: &str) -> Result<usize, TxRxError> {
        self.devices
            .iter()
            .position(|d| d.indexed_name() == name)
            .ok_or_else(|| TxRxError::NotFound(name.to_string()))
    }

    fn index_by_address(&self, address: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.address() == address)
    }

    fn notify(&self, notification: Notification) {
        self.dispatcher.notify(notification);
    }
}
