use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};

/// Public address used only to pick the outbound interface; nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Best guess at this machine's primary IPv4 address: the local side of a
/// connected UDP socket. Falls back to loopback when there is no route.
pub fn primary_ipv4() -> IpAddr {
    match probe_route() {
        Some(ip) => ip,
        None => {
            tracing::debug!("No outbound route found, using 127.0.0.1 as own address");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn probe_route() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_PROBE_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// First port at or above `start` that `host` can bind.
pub fn find_available_port(host: &str, start: u16) -> Option<u16> {
    (start..=u16::MAX).find(|&port| TcpListener::bind((host, port)).is_ok())
}

/// `count` distinct bindable ports, scanning upward from `start`.
pub fn find_available_ports(host: &str, start: u16, count: usize) -> Option<Vec<u16>> {
    let mut ports = Vec::with_capacity(count);
    let mut next = start;
    while ports.len() < count {
        let port = find_available_port(host, next)?;
        ports.push(port);
        next = port.checked_add(1)?;
    }
    Some(ports)
}
