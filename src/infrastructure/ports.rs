//! Port manager - TCP availability probes and range scans
//!
//! Availability is tested by actually binding 127.0.0.1:port and releasing
//! immediately. Containers are authoritative owners of the ports they
//! claim while running; the scan skips those even when nothing is bound
//! at probe time.

use std::collections::HashSet;

use tokio::net::TcpListener;
use tracing::debug;

use crate::domain::engine::PortRange;
use crate::domain::errors::{SpinError, SpinResult};

/// Whether `port` can be bound on the loopback interface right now
pub async fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}

/// Find a free port: probe `preferred` first, then scan the range
/// inclusively, skipping ports owned by running containers.
pub async fn find_available_port(
    preferred: Option<u16>,
    range: PortRange,
    owned: &HashSet<u16>,
) -> SpinResult<u16> {
    if let Some(port) = preferred {
        if port != 0 && !owned.contains(&port) && is_port_available(port).await {
            return Ok(port);
        }
        debug!("🔌 Preferred port {:?} unavailable, scanning {}-{}", preferred, range.lo, range.hi);
    }
    for port in range.lo..=range.hi {
        if owned.contains(&port) {
            continue;
        }
        if is_port_available(port).await {
            return Ok(port);
        }
    }
    Err(SpinError::NoPortsAvailable { lo: range.lo, hi: range.hi })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_free_port_is_available() {
        // Bind an ephemeral port, note it, release it, then probe
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(is_port_available(port).await);
    }

    #[tokio::test]
    async fn test_bound_port_is_unavailable() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_scan_skips_owned_ports() {
        // Reserve two adjacent free ports to build a deterministic range
        let a = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let lo = a.local_addr().unwrap().port();
        drop(a);

        let mut owned = HashSet::new();
        owned.insert(lo);
        let range = PortRange { lo, hi: lo.saturating_add(20) };
        let found = find_available_port(Some(lo), range, &owned).await.unwrap();
        assert_ne!(found, lo);
        assert!(found > lo && found <= range.hi);
    }

    #[tokio::test]
    async fn test_exhausted_range_errors() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut owned = HashSet::new();
        owned.insert(port);
        let range = PortRange { lo: port, hi: port };
        let err = find_available_port(None, range, &owned).await.unwrap_err();
        assert!(matches!(err, SpinError::NoPortsAvailable { .. }));
        drop(listener);
    }
}
