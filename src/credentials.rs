//! League client credential discovery
//!
//! The League client exposes its local API behind a one-time auth token and
//! port, both of which only exist on the client process's command line. This
//! module polls the OS process table, extracts the pair, and fans out
//! connect/disconnect notifications when the client appears or goes away.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::config::LcuConfig;

/// How long `stop` waits for the poll task before giving up.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Discovered League client credentials.
///
/// A value of this type is only ever constructed fully formed: token and
/// port are both present or the credential slot holds `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Auth token from `--remoting-auth-token`.
    pub token: String,
    /// API port from `--app-port`.
    pub port: u16,
    /// When this pair was first observed.
    pub discovered_at: DateTime<Utc>,
}

impl Credentials {
    /// `Authorization` header value for the local API (`riot:<token>`).
    pub fn basic_auth(&self) -> String {
        let raw = format!("riot:{}", self.token);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }
}

/// Shared credential slot, written by the monitor and read by the LCU client.
pub type SharedCredentials = Arc<RwLock<Option<Credentials>>>;

/// Watches the process table for the League client and keeps the shared
/// credential slot current.
#[derive(Clone)]
pub struct CredentialMonitor {
    creds: SharedCredentials,
    process_names: Arc<Vec<String>>,
    discovery_interval: Duration,
    rediscovery_interval: Duration,
    token_re: Arc<Regex>,
    port_re: Arc<Regex>,
    listeners: Arc<CallbackRegistry<bool>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CredentialMonitor {
    pub fn new(config: &LcuConfig) -> Result<Self> {
        // Accept both quoted and unquoted argument forms.
        let token_re = Regex::new(r#"--remoting-auth-token=(?:"([^"]+)"|([^"\s]+))"#)
            .context("Invalid auth token pattern")?;
        let port_re = Regex::new(r#"--app-port=(?:"([^"]+)"|([^"\s]+))"#)
            .context("Invalid app port pattern")?;

        Ok(Self {
            creds: Arc::new(RwLock::new(None)),
            process_names: Arc::new(config.process_names.clone()),
            discovery_interval: Duration::from_secs(config.discovery_interval_secs),
            rediscovery_interval: Duration::from_secs(config.rediscovery_interval_secs),
            token_re: Arc::new(token_re),
            port_re: Arc::new(port_re),
            listeners: Arc::new(CallbackRegistry::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: Arc::new(Mutex::new(None)),
        })
    }

    /// Handle to the credential slot, shared with the LCU client.
    pub fn credentials(&self) -> SharedCredentials {
        self.creds.clone()
    }

    /// Whether a client process is currently discovered.
    pub fn is_discovered(&self) -> bool {
        self.creds.read().unwrap().is_some()
    }

    /// Register a connection callback. The callback is immediately invoked
    /// once with the current state.
    pub fn add_connection_callback(
        &self,
        callback: Arc<dyn Fn(bool) + Send + Sync>,
    ) -> CallbackId {
        self.listeners.add_with_replay(callback)
    }

    pub fn remove_connection_callback(&self, id: CallbackId) {
        self.listeners.remove(id);
    }

    /// Start the discovery poll task. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Credential monitor is already running");
            return;
        }
        info!("Starting League client monitor");
        let monitor = self.clone();
        let handle = tokio::spawn(async move { monitor.run().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the poll task and clear credentials.
    ///
    /// The task is joined with a bounded timeout and aborted if it does not
    /// exit in time; credentials are cleared either way.
    pub async fn stop(&self) {
        info!("Stopping League client monitor");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let handle = self.task.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Monitor task did not stop in time, aborting");
                handle.abort();
            }
        }

        *self.creds.write().unwrap() = None;
        info!("League client monitor stopped");
    }

    async fn run(&self) {
        debug!("Credential monitor task started");
        let mut system = System::new();

        while self.running.load(Ordering::SeqCst) {
            self.poll_once(&mut system);

            let interval = if self.is_discovered() {
                self.rediscovery_interval
            } else {
                self.discovery_interval
            };

            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Credential monitor task ending");
    }

    /// One discovery cycle: scan, compare against the last known pair, and
    /// notify only on change.
    fn poll_once(&self, system: &mut System) {
        let found = self.discover(system);
        let changed = {
            let mut slot = self.creds.write().unwrap();
            let changed = match (&*slot, &found) {
                (Some(old), Some(new)) => old.token != new.token || old.port != new.port,
                (None, None) => false,
                _ => true,
            };
            if changed {
                *slot = found.clone();
            }
            changed
        };

        if changed {
            if let Some(creds) = &found {
                info!(port = creds.port, "League client discovered");
                self.listeners.notify(true);
            } else {
                info!("League client is gone");
                self.listeners.notify(false);
            }
        }
    }

    /// Scan the process table for a client process and extract its
    /// credentials. Per-process failures are skipped, the scan continues.
    fn discover(&self, system: &mut System) -> Option<Credentials> {
        system.refresh_processes(ProcessesToUpdate::All, true);

        for process in system.processes().values() {
            let name = process.name().to_string_lossy();
            if !self.process_names.iter().any(|n| n.as_str() == name.as_ref()) {
                continue;
            }

            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            if cmdline.is_empty() {
                continue;
            }

            debug!(process = %name, "Found League client process");
            match extract_credentials(&self.token_re, &self.port_re, &cmdline) {
                Some((token, port)) => {
                    return Some(Credentials {
                        token,
                        port,
                        discovered_at: Utc::now(),
                    });
                }
                None => {
                    debug!("Auth token or port not found on the command line");
                }
            }
        }

        None
    }
}

/// Pull the auth token and port out of a client command line. Returns `None`
/// unless both are present and the port parses.
fn extract_credentials(token_re: &Regex, port_re: &Regex, cmdline: &str) -> Option<(String, u16)> {
    let token = first_capture(token_re, cmdline)?;
    let port = first_capture(port_re, cmdline)?.parse::<u16>().ok()?;
    Some((token, port))
}

fn first_capture(re: &Regex, haystack: &str) -> Option<String> {
    let caps = re.captures(haystack)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LcuConfig;

    fn monitor() -> CredentialMonitor {
        CredentialMonitor::new(&LcuConfig::default()).unwrap()
    }

    #[test]
    fn extracts_unquoted_arguments() {
        let m = monitor();
        let cmdline = "LeagueClientUx.exe --remoting-auth-token=sEcR3t --app-port=51234 --locale=en_US";
        let (token, port) = extract_credentials(&m.token_re, &m.port_re, cmdline).unwrap();
        assert_eq!(token, "sEcR3t");
        assert_eq!(port, 51234);
    }

    #[test]
    fn extracts_quoted_arguments() {
        let m = monitor();
        let cmdline = r#"LeagueClientUx.exe "--remoting-auth-token=abc+def" "--app-port=443""#;
        let (token, port) = extract_credentials(&m.token_re, &m.port_re, cmdline).unwrap();
        assert_eq!(token, "abc+def");
        assert_eq!(port, 443);
    }

    #[test]
    fn token_and_port_are_all_or_nothing() {
        let m = monitor();
        assert!(extract_credentials(
            &m.token_re,
            &m.port_re,
            "LeagueClientUx.exe --remoting-auth-token=abc"
        )
        .is_none());
        assert!(extract_credentials(
            &m.token_re,
            &m.port_re,
            "LeagueClientUx.exe --app-port=1234"
        )
        .is_none());
        assert!(extract_credentials(
            &m.token_re,
            &m.port_re,
            "LeagueClientUx.exe --app-port=notaport --remoting-auth-token=abc"
        )
        .is_none());
    }

    #[test]
    fn basic_auth_header_encodes_riot_prefix() {
        let creds = Credentials {
            token: "token".to_string(),
            port: 1234,
            discovered_at: Utc::now(),
        };
        // base64("riot:token")
        assert_eq!(creds.basic_auth(), "Basic cmlvdDp0b2tlbg==");
    }

    #[test]
    fn late_connection_callback_gets_current_state() {
        let m = monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        m.add_connection_callback(Arc::new(move |connected| {
            seen2.lock().unwrap().push(connected)
        }));
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }
}
