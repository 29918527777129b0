//! Socket setup shared by acceptors and workers.

use crate::channel::ChannelConfig;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Opens a non-blocking listening socket with the channel's options.
pub(crate) fn bind_listener(addr: SocketAddr, config: &ChannelConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(config.reuse_address())?;
    if let Some(size) = config.receive_buffer_size() {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(config.backlog()).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Applies the per-connection options to a connected or connecting socket.
pub(crate) fn apply_socket_options(stream: &TcpStream, config: &ChannelConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_no_delay())?;
    let socket = SockRef::from(stream);
    socket.set_keepalive(config.keep_alive())?;
    if let Some(size) = config.receive_buffer_size() {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size() {
        socket.set_send_buffer_size(size)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OptionValue;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &ChannelConfig::default())
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_port_in_use_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let result = bind_listener(taken.local_addr().unwrap(), &ChannelConfig::default());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_apply_options_to_connected_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let std_stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let stream = TcpStream::from_std(std_stream);

        let mut config = ChannelConfig::default();
        config
            .set_option("tcpNoDelay", OptionValue::Bool(true))
            .unwrap();
        config
            .set_option("keepAlive", OptionValue::Bool(true))
            .unwrap();
        apply_socket_options(&stream, &config).unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
