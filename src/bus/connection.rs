//! Broker connection lifecycle.
//!
//! A [`ConnectionManager`] owns at most one connection and one channel for a
//! single role (publisher or consumer). The handle is created lazily on first
//! use and cached. Two ways it goes away:
//!
//! - **Clean close**: the cached handle is dropped and the next
//!   [`ConnectionManager::ensure_ready`] establishes a new one. In-flight work
//!   on the old channel is not resumed.
//! - **Transport error**: the [`FatalHandler`] is invoked. The default,
//!   [`ExitProcess`], logs and terminates the process so the supervisor's
//!   restart policy takes over. No in-process reconnect loop exists.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    connector_for, BrokerChannel, BusError, ChannelBroker, Connector, ErrorHook, Result, Topology,
};

/// Which side of the broker a manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// Reaction to a transport error on an established connection.
pub trait FatalHandler: Send + Sync {
    fn transport_failed(&self, role: Role, error: &BusError);
}

/// Log the error and exit with status 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn transport_failed(&self, role: Role, error: &BusError) {
        error!(role = %role, error = %error, "Broker connection error, terminating process");
        std::process::exit(1);
    }
}

/// Pick the transport for a configured broker URL.
///
/// Returns the URL to use (`None` when messaging is off) and its connector.
/// A blank URL or an unusable scheme disables messaging; the latter with a
/// warning.
pub fn resolve_transport(url: Option<&str>) -> (Option<String>, Arc<dyn Connector>) {
    let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
        return (None, Arc::new(ChannelBroker::new()));
    };
    match connector_for(url) {
        Ok(connector) => (Some(url.to_owned()), connector),
        Err(e) => {
            warn!(error = %e, "Cannot use broker URL, messaging disabled");
            (None, Arc::new(ChannelBroker::new()))
        }
    }
}

/// Lazily established, cached broker channel for one role.
pub struct ConnectionManager {
    role: Role,
    url: Option<String>,
    connector: Arc<dyn Connector>,
    topology: Topology,
    fatal: Arc<dyn FatalHandler>,
    link: Mutex<Option<Arc<dyn BrokerChannel>>>,
    disabled_logged: AtomicBool,
    established: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager. `url: None` (or an empty string) disables messaging.
    pub fn new(
        role: Role,
        url: Option<String>,
        connector: Arc<dyn Connector>,
        topology: Topology,
    ) -> Self {
        Self {
            role,
            url: url.filter(|u| !u.trim().is_empty()),
            connector,
            topology,
            fatal: Arc::new(ExitProcess),
            link: Mutex::new(None),
            disabled_logged: AtomicBool::new(false),
            established: AtomicU64::new(0),
        }
    }

    /// Create a manager whose transport is chosen by the URL scheme.
    ///
    /// An unusable scheme disables messaging with a warning instead of
    /// failing startup.
    pub fn for_url(role: Role, url: Option<&str>, topology: Topology) -> Self {
        let (url, connector) = resolve_transport(url);
        Self::new(role, url, connector, topology)
    }

    /// Replace the reaction to transport errors.
    pub fn with_fatal_handler(mut self, fatal: Arc<dyn FatalHandler>) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether a broker URL is configured.
    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Number of times a channel has been established.
    pub fn established_count(&self) -> u64 {
        self.established.load(Ordering::Acquire)
    }

    /// Return a usable channel, connecting and declaring topology if needed.
    ///
    /// Returns `Ok(None)` when messaging is disabled. Concurrent callers
    /// serialize on the cached slot; only the first connects.
    pub async fn ensure_ready(&self) -> Result<Option<Arc<dyn BrokerChannel>>> {
        let Some(url) = self.url.as_deref() else {
            self.log_disabled();
            return Ok(None);
        };

        let mut link = self.link.lock().await;

        if let Some(channel) = link.as_ref() {
            if channel.is_open() {
                return Ok(Some(Arc::clone(channel)));
            }
            info!(role = %self.role, "Broker channel closed, re-establishing");
            *link = None;
        }

        let channel = self.connector.connect(url, self.error_hook()).await?;

        if let Err(e) = self.topology.declare(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                warn!(role = %self.role, error = %close_err, "Failed to close channel after topology error");
            }
            return Err(e);
        }

        self.established.fetch_add(1, Ordering::AcqRel);
        info!(
            role = %self.role,
            exchange = %self.topology.exchange,
            url = %redact_url(url),
            "Broker channel established"
        );

        *link = Some(Arc::clone(&channel));
        Ok(Some(channel))
    }

    /// The cached channel if one is open. Never connects.
    pub async fn current(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .map(Arc::clone)
    }

    /// Close and forget the cached channel, if any.
    pub async fn close(&self) -> Result<()> {
        let taken = self.link.lock().await.take();
        if let Some(channel) = taken {
            if channel.is_open() {
                channel.close().await?;
            }
            info!(role = %self.role, "Broker channel closed");
        }
        Ok(())
    }

    fn error_hook(&self) -> ErrorHook {
        let fatal = Arc::clone(&self.fatal);
        let role = self.role;
        Arc::new(move |err: BusError| fatal.transport_failed(role, &err))
    }

    fn log_disabled(&self) {
        if !self.disabled_logged.swap(true, Ordering::AcqRel) {
            warn!(role = %self.role, "Broker URL is not set, messaging disabled");
        }
    }
}

/// Strip credentials from a broker URL for logging.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
