//! Socket factory.
//!
//! Every socket in the system is created here and is non-blocking from the
//! start: the listener the dispatcher accepts on, and the outbound client
//! sockets connecting to other endpoints. Built with socket2 so the buffer
//! sizes and address options are visible before the socket is handed to mio.

use crate::registry::ConnState;
use crate::sink::{Category, LogSink};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};

const LISTEN_BACKLOG: i32 = 8;

fn new_tcp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create the listening socket for inbound endpoint connections.
///
/// Failure here is fatal to the process; there is no endpoint without a
/// listener.
pub fn listen(addr: SocketAddr, sink: &dyn LogSink) -> io::Result<TcpListener> {
    let socket = new_tcp_socket(addr)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let rcvbuf = socket.recv_buffer_size()?;
    let sndbuf = socket.send_buffer_size()?;
    sink.emit(
        Category::Socket,
        &format!(
            "server socket listening on port {} (rcvbuf = {rcvbuf}, sndbuf = {sndbuf})",
            addr.port()
        ),
    );

    Ok(TcpListener::from_std(socket.into()))
}

/// Create a client socket and start a non-blocking connect to another
/// endpoint.
///
/// Immediate success yields `Ready`; an in-progress connect yields
/// `Pending` and resolves later on the socket's first write-readiness.
/// Every other failure is returned as the error it is, and no socket
/// survives the call.
pub fn connect_endpoint(
    host: IpAddr,
    dest_port: u16,
    sink: &dyn LogSink,
) -> io::Result<(TcpStream, ConnState)> {
    if dest_port == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "must specify destination port for this connection",
        ));
    }

    let addr = SocketAddr::new(host, dest_port);
    let socket = new_tcp_socket(addr)?;

    let state = match socket.connect(&addr.into()) {
        Ok(()) => ConnState::Ready,
        Err(ref e) if in_progress(e) => ConnState::Pending,
        Err(e) => return Err(e),
    };

    sink.emit(
        Category::Socket,
        &format!(
            "socket connect (port {dest_port}): {}",
            match state {
                ConnState::Ready => "complete",
                ConnState::Pending => "in progress",
            }
        ),
    );

    Ok((TcpStream::from_std(socket.into()), state))
}

/// A non-blocking connect that has merely started reports EINPROGRESS.
fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}
