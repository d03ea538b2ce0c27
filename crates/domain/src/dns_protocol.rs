use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

pub const DNS_PORT: u16 = 53;
pub const TLS_PORT: u16 = 853;

/// One configured upstream endpoint.
///
/// `Udp` is plain DNS: queries go over UDP unless TCP is forced for the
/// attempt. `Tcp` always uses TCP and `Tls` always wraps TCP in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsProtocol {
    Udp { addr: SocketAddr },
    Tcp { addr: SocketAddr },
    Tls { addr: SocketAddr },
}

impl DnsProtocol {
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            DnsProtocol::Udp { addr } | DnsProtocol::Tcp { addr } | DnsProtocol::Tls { addr } => {
                *addr
            }
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            DnsProtocol::Udp { .. } => "UDP",
            DnsProtocol::Tcp { .. } => "TCP",
            DnsProtocol::Tls { .. } => "TLS",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, DnsProtocol::Tls { .. })
    }
}

fn parse_host_port(s: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    let bare = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s);
    bare.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

impl FromStr for DnsProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("tls://") {
            let addr = parse_host_port(rest, TLS_PORT)
                .ok_or_else(|| format!("Invalid TLS address '{}'", rest))?;
            return Ok(DnsProtocol::Tls { addr });
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = parse_host_port(rest, DNS_PORT)
                .ok_or_else(|| format!("Invalid TCP address '{}'", rest))?;
            return Ok(DnsProtocol::Tcp { addr });
        }
        let plain = s
            .strip_prefix("udp://")
            .or_else(|| s.strip_prefix("dns://"))
            .unwrap_or(s);
        parse_host_port(plain, DNS_PORT)
            .map(|addr| DnsProtocol::Udp { addr })
            .ok_or_else(|| {
                format!(
                    "Invalid DNS endpoint format: '{}'. Expected: udp://IP[:PORT], dns://IP[:PORT], tcp://IP[:PORT], tls://IP[:PORT] or IP[:PORT]",
                    s
                )
            })
    }
}

impl fmt::Display for DnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsProtocol::Udp { addr } => write!(f, "udp://{}", addr),
            DnsProtocol::Tcp { addr } => write!(f, "tcp://{}", addr),
            DnsProtocol::Tls { addr } => write!(f, "tls://{}", addr),
        }
    }
}
