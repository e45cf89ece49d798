//! Process-wide external port allocation.
//!
//! Ports are probed by binding a listener and releasing it immediately.
//! The window between release and the container claiming the port is
//! accepted; the cursor only moves forward so a released port is not handed
//! out again until the range wraps.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::Port;
use parking_lot::Mutex;

/// Allocates external ports from an inclusive range.
///
/// Shared between environments through an `Arc`.
#[derive(Debug)]
pub struct PortAllocator {
    min: Port,
    max: Port,
    next: Mutex<u32>,
}

impl PortAllocator {
    /// Creates an allocator over `min..=max`.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` if `min > max` or `min == 0`.
    pub fn new(min: Port, max: Port) -> Result<Self> {
        if min > max || min == 0 {
            return Err(EphemeraError::Config {
                message: format!("invalid port range {min}-{max}"),
            });
        }
        Ok(Self {
            min,
            max,
            next: Mutex::new(u32::from(min)),
        })
    }

    /// Returns the inclusive bounds of the range.
    #[must_use]
    pub const fn range(&self) -> (Port, Port) {
        (self.min, self.max)
    }

    /// Returns the next port that could be bound at the time of the call.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Exhausted` once every port of the range was
    /// found busy during this call, or an I/O error if probing fails for a
    /// reason other than the port being in use.
    pub fn next_port(&self) -> Result<Port> {
        let mut next = self.next.lock();
        let width = u32::from(self.max) - u32::from(self.min);
        let mut span = 0_u32;

        loop {
            if *next > u32::from(self.max) {
                *next = u32::from(self.min);
            }
            let port = Port::try_from(*next).map_err(|_| self.exhausted())?;

            match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)) {
                Ok(listener) => {
                    drop(listener);
                    *next += 1;
                    tracing::trace!(port, "allocated external port");
                    return Ok(port);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    *next += 1;
                    span += 1;
                    if span > width {
                        tracing::warn!(min = self.min, max = self.max, "port range exhausted");
                        return Err(self.exhausted());
                    }
                }
                Err(e) => return Err(EphemeraError::io(format!("0.0.0.0:{port}"), e)),
            }
        }
    }

    fn exhausted(&self) -> EphemeraError {
        EphemeraError::Exhausted {
            resource: "ports",
            range: format!("{}-{}", self.min, self.max),
        }
    }
}
