//! Free-port discovery for process-group rendezvous.
//!
//! The OS hands out an ephemeral port, we release it and hand the number to the
//! workers. Between release and the leader re-binding it another process may take
//! it; that window is accepted. What we do guarantee is that the port could be
//! bound again right after release, checked up to `max_attempts` times.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_PORT_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port found after {attempts} attempts, last error: {last}")]
    Exhausted {
        attempts: usize,
        last: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    max_attempts: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_ATTEMPTS)
    }
}

impl PortAllocator {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut last = std::io::Error::other("no attempt made");
        for attempt in 1..=self.max_attempts {
            match try_allocate() {
                Ok(port) => {
                    debug!(port, attempt, "Allocated rendezvous port");
                    return Ok(port);
                }
                Err(err) => {
                    warn!(attempt, "Free port probe failed: {err}");
                    last = err;
                }
            }
        }
        Err(PortError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

fn try_allocate() -> std::io::Result<u16> {
    // Binding to port 0 will cause the OS to find an available port for us
    let port = {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        listener.local_addr()?.port()
    };
    // make sure it's actually free again now that we let go of it
    drop(TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_bindable() {
        let port = PortAllocator::default().allocate().unwrap();
        assert_ne!(port, 0);
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        assert!(listener.is_ok());
    }

    #[test]
    fn at_least_one_attempt() {
        let allocator = PortAllocator::new(0);
        assert!(allocator.allocate().is_ok());
    }
}
