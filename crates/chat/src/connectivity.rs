use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_PROBE_ADDR: &str = "generativelanguage.googleapis.com:443";
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Shared online/offline flag. Subscribers are woken only on transitions.
#[derive(Debug, Clone)]
pub struct ConnectivityGate {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityGate {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns `true` when the value actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            tracing::info!(online, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Derives connectivity by opening a TCP connection to the model API host.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    addr: String,
    interval: Duration,
    timeout: Duration,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_ADDR)
    }
}

impl ConnectivityProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn probe_once(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                tracing::debug!(addr = %self.addr, error = %error, "connectivity probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, timeout = ?self.timeout, "connectivity probe timed out");
                false
            }
        }
    }

    /// Probes on every tick and pushes the result into `gate`. The first
    /// tick fires immediately.
    pub fn spawn(self, gate: ConnectivityGate) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = self.probe_once().await;
                gate.set_online(online);
            }
        })
    }
}
