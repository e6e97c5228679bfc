//! Network reachability probes
//!
//! A positive answer only means a remote call is worth attempting. Callers
//! must still handle the remote call failing.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connectivity oracle consumed by the repositories
pub trait Connectivity: Send + Sync {
    /// Whether the device currently has a usable network transport.
    fn is_online(&self) -> bool;
}

/// Fixed connectivity answer that can be flipped at runtime
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Probe that reports online when a TCP connection to `addr` succeeds
///
/// `is_online` only reads the last result. The connection attempt itself runs
/// asynchronously in [`refresh`](Self::refresh), usually from the task started
/// by [`spawn_refresh`](Self::spawn_refresh). Reports offline until the first
/// refresh completes.
#[derive(Debug)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
    online: AtomicBool,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            online: AtomicBool::new(false),
        }
    }

    /// Attempt a connection now and record the result.
    ///
    /// Resolution and connection together are bounded by the probe timeout.
    pub async fn refresh(&self) -> bool {
        let online = match tokio::time::timeout(self.timeout, connect_any(&self.addr)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", self.addr, e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe to {} timed out after {:?}", self.addr, self.timeout);
                false
            }
        };
        if self.online.swap(online, Ordering::SeqCst) != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        online
    }

    /// Refresh every `interval` until `shutdown` flips to `true` or its sender
    /// is dropped.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let probe = Arc::clone(self);
        let period = interval.max(MIN_REFRESH_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe.refresh().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Connectivity for TcpProbe {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(10);

async fn connect_any(addr: &str) -> io::Result<()> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, format!("{} resolved to no addresses", addr));
    for candidate in lookup_host(addr).await? {
        match TcpStream::connect(candidate).await {
            Ok(_) => return Ok(()),
            Err(e) => last = e,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_static_connectivity_toggle() {
        let conn = StaticConnectivity::online();
        assert!(conn.is_online());
        conn.set_online(false);
        assert!(!conn.is_online());
    }

    #[tokio::test]
    async fn test_tcp_probe_starts_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = TcpProbe::new(listener.local_addr().unwrap().to_string(), Duration::from_millis(500));
        assert!(!probe.is_online());
    }

    #[tokio::test]
    async fn test_tcp_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = TcpProbe::new(listener.local_addr().unwrap().to_string(), Duration::from_millis(500));
        assert!(probe.refresh().await);
        assert!(probe.is_online());
    }

    #[tokio::test]
    async fn test_tcp_probe_unreachable() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let probe = TcpProbe::new(addr.to_string(), Duration::from_millis(200));
        assert!(!probe.refresh().await);
        assert!(!probe.is_online());
    }

    #[tokio::test]
    async fn test_tcp_probe_bad_address() {
        let probe = TcpProbe::new("not an address", Duration::from_millis(100));
        assert!(!probe.refresh().await);
    }

    #[tokio::test]
    async fn test_tcp_probe_background_refresh() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = Arc::new(TcpProbe::new(
            listener.local_addr().unwrap().to_string(),
            Duration::from_millis(500),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = probe.spawn_refresh(Duration::from_millis(20), rx);

        for _ in 0..50 {
            if probe.is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(probe.is_online());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
