use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

use crate::types::OutputOptions;

/// Creates and configures a UDP socket for TS packet reception
/// Handles both unicast and multicast addresses
pub fn create_input_socket(addr: &SocketAddr) -> anyhow::Result<Socket> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        _ => anyhow::bail!("only IPv4 is supported"),
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;

    // Join multicast group if the address is multicast
    if ip.is_multicast() {
        let iface = Ipv4Addr::UNSPECIFIED; // default interface
        socket.join_multicast_v4(&ip, &iface)?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Creates the non-blocking sender socket, connected to the destination.
pub fn create_output_socket(opts: &OutputOptions) -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if let Some(size) = opts.socket_size {
        socket.set_send_buffer_size(size)?;
    }
    if opts.addr.is_multicast() {
        socket.set_multicast_ttl_v4(opts.ttl)?;
        if let Some(local) = opts.localaddr {
            socket.set_multicast_if_v4(&local)?;
        }
    } else if opts.ttl > 0 {
        socket.set_ttl(opts.ttl)?;
    }

    let local = SocketAddrV4::new(opts.localaddr.unwrap_or(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&SocketAddr::from(local).into())?;
    socket.connect(&SocketAddr::from(SocketAddrV4::new(opts.addr, opts.port)).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
