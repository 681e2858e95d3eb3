//! WiFi connection orchestration.
//!
//! A connect request is handed to a worker thread that issues the activation
//! command and then polls the [`StatusDetector`] until one terminal
//! [`ConnectionOutcome`] is reached. The caller gets a [`ConnectionHandle`]
//! back immediately and may cancel at any time; the flag is checked before
//! every sleep, so a cancel lands within one poll interval even while the
//! activation command itself is still blocked.
//!
//! # Example
//!
//! ```no_run
//! use netpilot::{NetContext, config::Config};
//! use netpilot::scan::NetworkIdentity;
//! use zeroize::Zeroizing;
//!
//! let ctx = NetContext::detect(&Config::default())?;
//! let handle = ctx.orchestrator().connect(
//!     &NetworkIdentity::new("Home", "WPA2"),
//!     Some(Zeroizing::new("password123".to_string())),
//! )?;
//! println!("{}", handle.wait());
//! # Ok::<(), netpilot::NetError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backend::{Backend, ConnectionStatus, ProfileState};
use crate::diagnostics::DiagnosticQueue;
use crate::error::{ErrorKind, NetError, Result};
use crate::exec::CommandRunner;
use crate::iw::Iw;
use crate::sanitize::{validate_identity, validate_password};
use crate::scan::NetworkIdentity;
use crate::status::{Classification, Readiness, StatusDetector};

/// A WiFi password, wiped from memory when dropped.
pub type Credential = Zeroizing<String>;

/// Poll cadence for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_iterations: u32,
    /// Also wait for an address on open networks.
    pub require_ip_for_open: bool,
    /// Pause after disconnect commands before checking the result.
    pub settle: Duration,
}

impl PollSettings {
    /// 100 ms for up to 15 s, for a user watching a terminal.
    pub fn interactive() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_iterations: 150,
            require_ip_for_open: false,
            settle: Duration::from_millis(1500),
        }
    }

    /// 1 s for up to 13 s, for unattended use.
    pub fn batch() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_iterations: 13,
            ..Self::interactive()
        }
    }

    /// Longest an attempt polls before timing out.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_iterations
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Terminal result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ConnectionOutcome {
    /// Connected to the SSID.
    Success(String),
    Failed(ErrorKind, String),
    TimedOut,
    Cancelled,
}

impl ConnectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionOutcome::Success(_))
    }
}

impl fmt::Display for ConnectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionOutcome::Success(ssid) => write!(f, "Connected to {}", ssid),
            ConnectionOutcome::Failed(kind, message) => {
                write!(f, "Connection failed ({}): {}", kind, message)
            }
            ConnectionOutcome::TimedOut => f.write_str("Connection timed out"),
            ConnectionOutcome::Cancelled => f.write_str("Connection cancelled"),
        }
    }
}

/// The command that starts an attempt.
enum Activation {
    /// Reuse a saved profile and its stored secret.
    Profile(String),
    Open(String),
    Secured { ssid: String, psk: Credential },
}

impl Activation {
    /// Runs the (blocking) activation command. Consumes the credential.
    fn issue(self, backend: &dyn Backend) -> Result<()> {
        match self {
            Activation::Profile(name) => backend.activate_profile(&name),
            Activation::Open(ssid) => backend.connect_open(&ssid),
            Activation::Secured { ssid, psk } => backend.connect_secured(&ssid, &psk),
        }
    }

    fn creates_profile(&self) -> bool {
        !matches!(self, Activation::Profile(_))
    }
}

/// A running attempt.
pub struct ConnectionHandle {
    thread: JoinHandle<ConnectionOutcome>,
    cancel: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Blocks until the attempt reaches its outcome.
    pub fn wait(self) -> ConnectionOutcome {
        self.thread.join().unwrap_or_else(|_| {
            ConnectionOutcome::Failed(ErrorKind::Unknown, "connection worker panicked".to_string())
        })
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Drives connect and disconnect against one backend.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    runner: Arc<dyn CommandRunner>,
    detector: Arc<StatusDetector>,
    iw: Iw,
    queue: Arc<DiagnosticQueue>,
    settings: PollSettings,
    interface: Option<String>,
    /// Flag of the most recent attempt; each attempt gets its own.
    cancel: Mutex<Arc<AtomicBool>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        runner: Arc<dyn CommandRunner>,
        queue: Arc<DiagnosticQueue>,
        settings: PollSettings,
    ) -> Self {
        Self {
            detector: Arc::new(StatusDetector::new(Arc::clone(&backend), Arc::clone(&runner))),
            iw: Iw::new(Arc::clone(&runner)),
            runner,
            backend,
            queue,
            settings,
            interface: None,
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Pins connects, status and disconnects to one device.
    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        let detector = StatusDetector::new(Arc::clone(&self.backend), Arc::clone(&self.runner))
            .with_interface(interface.clone());
        self.detector = Arc::new(detector);
        self.interface = interface;
        self
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Starts a connection attempt and returns without waiting for it.
    ///
    /// # Arguments
    /// * `identity` - The network to join
    /// * `credential` - Password for a secured network without a saved profile
    ///
    /// # Returns
    /// - `Ok(ConnectionHandle)` once the worker is running
    /// - `Err(NetError::InvalidInput)` for a bad SSID, or a missing or
    ///   malformed credential; no command is issued in that case
    ///
    /// # Commands Executed
    /// ```bash
    /// nmcli connection up id <ssid>                  # saved profile
    /// nmcli device wifi connect <ssid>            # open network
    /// nmcli connection add type wifi ... wifi-sec.psk <psk> && nmcli connection up id <ssid>
    /// ```
    pub fn connect(
        &self,
        identity: &NetworkIdentity,
        credential: Option<Credential>,
    ) -> Result<ConnectionHandle> {
        let activation = validate_identity(&identity.ssid)
            .and_then(|()| self.plan(identity, credential))
            .inspect_err(|e| {
                self.queue
                    .report(&format!("Cannot connect to '{}'", identity.ssid), e)
            })?;

        let cancel = Arc::new(AtomicBool::new(false));
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&cancel);
        let attempt = Attempt {
            backend: Arc::clone(&self.backend),
            detector: Arc::clone(&self.detector),
            queue: Arc::clone(&self.queue),
            settings: self.settings,
            cancel: Arc::clone(&cancel),
            readiness: Readiness::for_identity(identity, self.settings.require_ip_for_open),
            ssid: identity.ssid.clone(),
        };

        info!(ssid = %identity.ssid, security = %identity.security, "connection attempt started");
        let thread = thread::Builder::new()
            .name("netpilot-connect".to_string())
            .spawn(move || attempt.run(activation))?;

        Ok(ConnectionHandle { thread, cancel })
    }

    fn plan(&self, identity: &NetworkIdentity, credential: Option<Credential>) -> Result<Activation> {
        let saved = self.backend.profile_exists(&identity.ssid).unwrap_or_else(|e| {
            debug!("profile lookup failed: {}", e);
            false
        });
        if saved {
            debug!(ssid = %identity.ssid, "reusing saved profile");
            return Ok(Activation::Profile(identity.ssid.clone()));
        }
        if identity.is_open() {
            return Ok(Activation::Open(identity.ssid.clone()));
        }

        let Some(psk) = credential else {
            return Err(NetError::InvalidInput(format!(
                "'{}' is secured ({}) and has no saved profile; a password is required",
                identity.ssid, identity.security
            )));
        };
        validate_password(&psk, &identity.security)?;
        Ok(Activation::Secured {
            ssid: identity.ssid.clone(),
            psk,
        })
    }

    /// Stops the most recent attempt at its next poll.
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store(true, Ordering::SeqCst);
    }

    /// Disconnects and verifies the interface is really down.
    ///
    /// The active profile is deactivated and the device disconnected. If the
    /// kernel still reports an association afterwards, the device is handed
    /// away from NetworkManager and back, which drops a stuck link.
    ///
    /// # Returns
    /// - `Ok(())` only once both NetworkManager and the kernel report nothing
    /// - `Err(NetError::Network)` if the interface is still associated
    ///
    /// # Commands Executed
    /// ```bash
    /// nmcli connection down id <profile>
    /// nmcli device disconnect <interface>
    /// nmcli device set <interface> managed no   # only if still associated
    /// nmcli device set <interface> managed yes
    /// ```
    pub fn disconnect(&self) -> Result<()> {
        let status = self.backend.query_connection_status().unwrap_or_else(|e| {
            debug!("status before disconnect unavailable: {}", e);
            ConnectionStatus::default()
        });

        if let Some(profile) = &status.profile {
            if let Err(e) = self.backend.deactivate_profile(profile) {
                debug!("deactivating {} failed: {}", profile, e);
            }
        }

        let mut devices: Vec<String> = self
            .interface
            .clone()
            .or_else(|| status.device.clone())
            .into_iter()
            .collect();
        if devices.is_empty() {
            // No profile to go by; a zombie link is only visible to the kernel
            devices = self.associated_interfaces();
        }
        for device in &devices {
            if let Err(e) = self.backend.disconnect_device(device) {
                debug!("device disconnect on {} failed: {}", device, e);
            }
        }
        self.settle();

        if self.detector.classify(Readiness::Associated) == Classification::NotConnected {
            info!("disconnected");
            return Ok(());
        }

        if devices.is_empty() {
            devices = self.associated_interfaces();
        }
        for device in &devices {
            warn!(device = %device, "still associated after disconnect, cycling managed state");
            if let Err(e) = self.backend.set_managed(device, false) {
                self.queue
                    .push_warning(&format!("Could not release {}: {}", device, e));
                continue;
            }
            self.settle();
            if let Err(e) = self.backend.set_managed(device, true) {
                self.queue
                    .push_error(&format!("Could not return {} to NetworkManager: {}", device, e));
            }
        }
        self.settle();

        match self.detector.classify(Readiness::Associated) {
            Classification::NotConnected => {
                info!("disconnected after resetting the interface");
                Ok(())
            }
            other => {
                let message = format!("interface still associated after disconnect ({:?})", other);
                self.queue.push_error(&message);
                Err(NetError::network(message))
            }
        }
    }

    fn associated_interfaces(&self) -> Vec<String> {
        self.iw
            .interfaces()
            .unwrap_or_default()
            .into_iter()
            .filter(|iface| self.iw.is_associated(iface).unwrap_or(false))
            .collect()
    }

    fn settle(&self) {
        if !self.settings.settle.is_zero() {
            thread::sleep(self.settings.settle);
        }
    }

    /// Current connection as NetworkManager reports it.
    pub fn status(&self) -> Result<ConnectionStatus> {
        self.backend.query_connection_status()
    }

    /// Three-way classification of the current connection.
    pub fn classify(&self) -> Classification {
        self.detector.classify(Readiness::Associated)
    }
}

/// Everything the worker thread owns for one attempt.
struct Attempt {
    backend: Arc<dyn Backend>,
    detector: Arc<StatusDetector>,
    queue: Arc<DiagnosticQueue>,
    settings: PollSettings,
    cancel: Arc<AtomicBool>,
    readiness: Readiness,
    ssid: String,
}

impl Attempt {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn run(self, activation: Activation) -> ConnectionOutcome {
        let started = Instant::now();
        let outcome = self.drive(activation);
        match &outcome {
            ConnectionOutcome::Success(ssid) => {
                info!(ssid = %ssid, elapsed_ms = started.elapsed().as_millis() as u64, "connected")
            }
            ConnectionOutcome::Failed(kind, message) => {
                self.queue
                    .push_error(&format!("Connection to {} failed: {}", self.ssid, message));
                info!(ssid = %self.ssid, %kind, "connection failed");
            }
            ConnectionOutcome::TimedOut => self.queue.push_error(&format!(
                "Connection to {} timed out after {:?}",
                self.ssid,
                self.settings.budget()
            )),
            ConnectionOutcome::Cancelled => info!(ssid = %self.ssid, "connection cancelled"),
        }
        outcome
    }

    fn drive(&self, activation: Activation) -> ConnectionOutcome {
        match self.backend.wifi_enabled() {
            Ok(false) => {
                return ConnectionOutcome::Failed(
                    ErrorKind::WifiDisabled,
                    "WiFi radio is disabled".to_string(),
                );
            }
            Ok(true) => {}
            Err(e) => debug!("radio state unknown: {}", e),
        }
        if self.cancelled() {
            return ConnectionOutcome::Cancelled;
        }

        let created = activation.creates_profile();
        let (tx, rx) = mpsc::channel();
        let backend = Arc::clone(&self.backend);
        let spawned = thread::Builder::new()
            .name("netpilot-activate".to_string())
            .spawn(move || {
                let _ = tx.send(activation.issue(backend.as_ref()));
            });
        if let Err(e) = spawned {
            return ConnectionOutcome::Failed(ErrorKind::Unknown, e.to_string());
        }

        let outcome = self.poll(&rx);
        if created {
            if let ConnectionOutcome::Failed(ErrorKind::AuthFailed, _) = outcome {
                // Do not leave a profile holding a wrong password behind
                if let Err(e) = self.backend.delete_profile(&self.ssid) {
                    debug!("removing rejected profile {} failed: {}", self.ssid, e);
                }
            }
        }
        outcome
    }

    fn poll(&self, rx: &Receiver<Result<()>>) -> ConnectionOutcome {
        let mut command_done = false;
        let mut seen_activating = false;

        for iteration in 0..self.settings.max_iterations {
            if self.cancelled() {
                return ConnectionOutcome::Cancelled;
            }

            if !command_done {
                match rx.try_recv() {
                    Ok(result) => {
                        command_done = true;
                        if let Some(outcome) = self.command_finished(result) {
                            return outcome;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => command_done = true,
                }
            }

            let observation = self.detector.observe(self.readiness, Some(&self.ssid));
            if observation.classification.is_connected_to(&self.ssid) {
                return ConnectionOutcome::Success(self.ssid.clone());
            }
            if observation.profile_state == Some(ProfileState::Activating) {
                seen_activating = true;
            } else if seen_activating && observation.profile_dropped() {
                debug!(iteration, "profile dropped out of activation");
                return self.activation_dropped(rx, command_done);
            }

            if self.cancelled() {
                return ConnectionOutcome::Cancelled;
            }
            thread::sleep(self.settings.interval);
        }
        ConnectionOutcome::TimedOut
    }

    /// `Some` when the command's exit decides the attempt.
    fn command_finished(&self, result: Result<()>) -> Option<ConnectionOutcome> {
        match result {
            Ok(()) => {
                debug!(ssid = %self.ssid, "activation command returned");
                None
            }
            Err(e @ NetError::SilentExit { .. }) => {
                self.queue
                    .push_warning(&format!("{}; still waiting for {}", e, self.ssid));
                None
            }
            Err(e @ NetError::InvalidInput(_)) => {
                Some(ConnectionOutcome::Failed(ErrorKind::Unknown, e.to_string()))
            }
            Err(e) => {
                let kind = e.kind();
                let message = match e {
                    NetError::Network { message, .. } => message,
                    other => other.to_string(),
                };
                Some(ConnectionOutcome::Failed(kind, message))
            }
        }
    }

    /// The profile was seen activating and then fell back. The command's
    /// diagnostic, if it arrives within one interval, names the reason.
    fn activation_dropped(&self, rx: &Receiver<Result<()>>, command_done: bool) -> ConnectionOutcome {
        if !command_done {
            if let Ok(Err(e)) = rx.recv_timeout(self.settings.interval) {
                if !matches!(e, NetError::SilentExit { .. }) {
                    let kind = e.kind();
                    return ConnectionOutcome::Failed(kind, e.to_string());
                }
            }
        }
        ConnectionOutcome::Failed(
            ErrorKind::Unknown,
            format!("{} was deactivated during activation", self.ssid),
        )
    }
}
