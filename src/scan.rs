use std::{
    collections::HashSet,
    fmt::{self, Display},
    time::Duration,
};

use crate::error::ScanError;

mod engine;
mod ledger;
pub mod pckt;
pub mod socket;
mod syn;
mod udp;

pub use self::{
    socket::Transport,
    syn::TcpScanner,
    udp::{UdpReport, UdpScanner},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Syn,
    Udp,
}

impl Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ScanType::Syn => "TCP",
                ScanType::Udp => "UDP",
            }
        )
    }
}

/// A port that answered, with its round trip time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpenPort {
    pub port: u16,
    pub rtt_ms: u64,
}

impl OpenPort {
    #[inline]
    fn new(port: u16, rtt: Duration) -> Self {
        // Rounded to the nearest millisecond.
        let rtt_ms = (rtt.as_micros() + 500) / 1000;
        Self {
            port,
            rtt_ms: rtt_ms as u64,
        }
    }
}

fn check_ports(ports: &HashSet<u16>) -> Result<(), ScanError> {
    if ports.contains(&0) {
        return Err(ScanError::InvalidPort(String::from("0")));
    }
    Ok(())
}

fn check_timeout(secs: f64) -> Result<Duration, ScanError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ScanError::InvalidTimeout(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ScanError::InvalidTimeout(secs))
}
