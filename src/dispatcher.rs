//! The readiness-driven event loop coordinating the whole endpoint.
//!
//! Single-threaded: the dispatcher exclusively owns the connection
//! registry, every outbound send queue, and the worker registry. Each cycle
//! it waits on the poll with a bounded tick, then services work in a fixed
//! order: worker exits, commands, one synthetic test message, the accept
//! loop, and finally each ready connection (write side before read side).
//!
//! Per-connection failures remove exactly that connection; nothing a single
//! peer does can take down the loop. Only a startup transport failure or a
//! non-interrupt poll failure is fatal.

use crate::command::Command;
use crate::config::Config;
use crate::net::frame::{recv_frame, RecvStatus};
use crate::net::socket;
use crate::package::{select_package, TransportMode};
use crate::registry::{AddError, ConnState, Registry};
use crate::sink::{preview, Category, LogSink};
use crate::supervisor::Supervisor;
use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

/// Most synthetic test messages a single `#t` may request.
const TEST_BURST_LIMIT: u32 = 99_999;

/// Process-wide interactive state, owned by the dispatcher.
///
/// Everything that was ambient configuration in older designs lives here
/// explicitly: the selected endpoint, the package transport, the worker
/// receive throttle, and the remaining synthetic test messages.
#[derive(Debug)]
struct Context {
    selected: Option<u16>,
    transport: TransportMode,
    recv_delay: bool,
    test_remaining: u32,
}

pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    registry: Registry,
    supervisor: Supervisor,
    commands: Receiver<Command>,
    sink: Arc<dyn LogSink>,
    host: IpAddr,
    capacity: usize,
    tick: Duration,
    ctx: Context,
}

impl Dispatcher {
    /// Bind the listener and assemble the loop. Returns the waker other
    /// threads use to interrupt the bounded poll wait.
    pub fn new(
        config: &Config,
        commands: Receiver<Command>,
        sink: Arc<dyn LogSink>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let mut listener = socket::listen(SocketAddr::new(host, config.port), &*sink)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let supervisor = Supervisor::new(Arc::clone(&waker), Arc::clone(&sink));

        let dispatcher = Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            registry: Registry::new(),
            supervisor,
            commands,
            sink,
            host,
            capacity: config.max_message,
            tick: Duration::from_millis(config.tick_ms),
            ctx: Context {
                selected: None,
                transport: TransportMode::Reindeer, // sorry, Rudolf - you're the cheapest
                recv_delay: false,
                test_remaining: 0,
            },
        };

        Ok((dispatcher, waker))
    }

    /// Run until a quit command arrives or the command source disappears.
    pub fn run(&mut self) -> io::Result<()> {
        self.sink.emit(
            Category::Status,
            &format!("endpoint ready on port {}", self.listener.local_addr()?.port()),
        );

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(self.tick)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    self.sink
                        .emit(Category::Other, "poll interrupted, restarting");
                    continue;
                }
                return Err(e);
            }

            // reap first so the dumps below see fresh liveness
            self.supervisor.reap();

            if !self.drain_commands() {
                break;
            }

            if self.ctx.test_remaining > 0 {
                self.send_test_message();
            }

            // accept before per-connection work, matching event priority
            let mut accept_ready = false;
            let mut ready: Vec<(u16, bool, bool)> = Vec::new();
            for event in self.events.iter() {
                match event.token() {
                    WAKER | LISTENER => {
                        if event.token() == LISTENER {
                            accept_ready = true;
                        }
                    }
                    Token(port) => {
                        ready.push((port as u16, event.is_writable(), event.is_readable()))
                    }
                }
            }

            if accept_ready {
                self.accept_connections();
            }

            for (port, writable, readable) in ready {
                if writable {
                    self.connection_writable(port);
                }
                if readable {
                    self.connection_readable(port);
                }
            }
        }

        Ok(())
    }

    /// Pull every queued command; returns false once the loop should stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    // any interactive input cancels a running test burst
                    self.ctx.test_remaining = 0;
                    if !self.process_command(command) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    self.sink
                        .emit(Category::Error, "command source disconnected");
                    return false;
                }
            }
        }
    }

    fn process_command(&mut self, command: Command) -> bool {
        debug!(?command, "processing command");
        match command {
            Command::Quit => {
                self.sink.emit(Category::Query, "endpoint exiting...");
                return false;
            }
            Command::SendMessage(text) => self.send_to_selected(Bytes::from(text)),
            Command::AddEndpoint(port) => self.add_endpoint(port),
            Command::RemoveEndpoint(port) => self.remove_connection(port),
            Command::SelectEndpoint(port) => {
                if self.registry.contains(port) {
                    self.ctx.selected = Some(port);
                } else {
                    self.sink.emit(
                        Category::Error,
                        &format!("connection to port {port} not found"),
                    );
                }
            }
            Command::ToggleDelay => {
                self.ctx.recv_delay = !self.ctx.recv_delay;
                self.sink.emit(
                    Category::Query,
                    &format!(
                        "worker receive delay {}",
                        if self.ctx.recv_delay { "on" } else { "off" }
                    ),
                );
            }
            Command::RunTest(count) => {
                if self.selected_live().is_none() {
                    self.sink.emit(
                        Category::Error,
                        "No active connection specified. Either create or select a connection to use",
                    );
                } else {
                    self.ctx.test_remaining = count.min(TEST_BURST_LIMIT);
                }
            }
            Command::SetPrintFilter(filter) => {
                self.sink.set_filter(filter);
                self.sink
                    .emit(Category::Query, &format!("print filter = {filter}"));
            }
            Command::ShowConnections => self.show_connections(),
            Command::SetTransportMode(mode) => {
                self.ctx.transport = mode;
                self.sink
                    .emit(Category::Query, &format!("package transport: {mode}"));
            }
            Command::SpecialPackage(address) => {
                let gift = select_package(address, self.ctx.transport);
                self.send_to_selected(Bytes::from(gift));
            }
        }
        true
    }

    /// Destination port of the selected connection, if it still exists.
    ///
    /// A Pending selection counts as live: submissions queue behind the
    /// in-progress connect and flush once it resolves.
    fn selected_live(&mut self) -> Option<u16> {
        let port = self.ctx.selected?;
        match self.registry.find_mut(port) {
            Some(_) => Some(port),
            None => {
                // connection vanished out from under the selection
                self.ctx.selected = None;
                None
            }
        }
    }

    fn send_to_selected(&mut self, payload: Bytes) {
        let Some(port) = self.selected_live() else {
            self.sink.emit(
                Category::Error,
                "No active connection specified. Either create or select a connection to use",
            );
            return;
        };

        let Some(conn) = self.registry.find_mut(port) else {
            return;
        };
        match conn.submit(payload) {
            Ok(outcome) => {
                if outcome.blocked {
                    self.sink.emit(
                        Category::Error,
                        &format!("socket send (port {port}): blocked"),
                    );
                }
            }
            Err(e) => {
                self.sink
                    .emit(Category::Error, &format!("socket send (port {port}): {e}"));
                self.remove_connection(port);
            }
        }
    }

    /// One synthetic message per wakeup while a test burst is active.
    fn send_test_message(&mut self) {
        let n = self.ctx.test_remaining;
        self.ctx.test_remaining -= 1;
        let payload = format!(
            "{n:05}: This is a test message to determine if the send process gets blocked. 01234567890123456789..."
        );
        self.send_to_selected(Bytes::from(payload));
    }

    fn add_endpoint(&mut self, port: u16) {
        match self.registry.add(self.host, port, &*self.sink) {
            Ok(conn) => {
                if let Err(e) = self.poll.registry().register(
                    &mut conn.stream,
                    Token(port as usize),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    self.sink.emit(
                        Category::Error,
                        &format!("registering connection (port {port}): {e}"),
                    );
                    self.registry.remove(port);
                    return;
                }
                // a new connection becomes the active selection
                self.ctx.selected = Some(port);
            }
            Err(AddError::Duplicate(port)) => {
                self.sink
                    .emit(Category::Error, &format!("{port} already connected"));
            }
            Err(AddError::Io(e)) => {
                self.sink.emit(
                    Category::Error,
                    &format!("socket connect (port {port}): {e}"),
                );
            }
        }
    }

    /// Close and drop an outbound connection, clearing the selection if it
    /// pointed there. Queued messages for it are abandoned.
    fn remove_connection(&mut self, port: u16) {
        match self.registry.remove(port) {
            Some(mut conn) => {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                if self.ctx.selected == Some(port) {
                    self.ctx.selected = None;
                }
                self.sink.emit(
                    Category::Other,
                    &format!("closing and removing connection to port {port}"),
                );
            }
            None => {
                self.sink
                    .emit(Category::Error, &format!("connection to {port} not found"));
            }
        }
    }

    /// Accept until the listener would block, handing each new socket to a
    /// worker. The dispatcher keeps no handle to accepted sockets.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let client_port = peer.port();
                    match self.supervisor.spawn(
                        stream,
                        client_port,
                        self.ctx.recv_delay,
                        self.capacity,
                    ) {
                        Ok(id) => {
                            self.sink.emit(
                                Category::Other,
                                &format!(
                                    "spawned worker {id} to handle port {client_port} (recv delay = {})",
                                    self.ctx.recv_delay
                                ),
                            );
                        }
                        Err(e) => {
                            self.sink.emit(
                                Category::Error,
                                &format!("spawning worker (port {client_port}): {e}"),
                            );
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.sink
                        .emit(Category::Error, &format!("socket accept: {e}"));
                    break;
                }
            }
        }
    }

    /// Write-readiness: resolve a pending connect, then drain the queue.
    fn connection_writable(&mut self, port: u16) {
        let mut failure: Option<(Category, String)> = None;

        if let Some(conn) = self.registry.find_mut(port) {
            if conn.state == ConnState::Pending {
                match conn.stream.take_error() {
                    Ok(None) => {
                        conn.send_port = conn.stream.local_addr().ok().map(|a| a.port());
                        conn.state = ConnState::Ready;
                        self.sink.emit(
                            Category::Socket,
                            &format!(
                                "socket connect complete (port {port}) - sending on port {}",
                                conn.send_port.unwrap_or(0)
                            ),
                        );
                    }
                    Ok(Some(e)) => {
                        failure = Some((
                            Category::Socket,
                            format!("socket connect failure (port {port}): {e}"),
                        ));
                    }
                    Err(e) => {
                        failure = Some((
                            Category::Socket,
                            format!("socket error query failed (port {port}): {e}"),
                        ));
                    }
                }
            }

            if failure.is_none() {
                match conn.flush() {
                    Ok(outcome) => {
                        if outcome.blocked {
                            self.sink.emit(
                                Category::Error,
                                &format!("socket send (port {port}): blocked"),
                            );
                        }
                    }
                    Err(e) => {
                        failure = Some((
                            Category::Error,
                            format!("socket send (port {port}): {e}"),
                        ));
                    }
                }
            }
        }

        if let Some((category, message)) = failure {
            self.sink.emit(category, &message);
            self.remove_connection(port);
        }
    }

    /// Read-readiness: pull frames until the socket blocks. Echo payloads
    /// bump the receive counter; close or failure drops the connection.
    fn connection_readable(&mut self, port: u16) {
        loop {
            let Some(conn) = self.registry.find_mut(port) else {
                return;
            };
            if conn.state != ConnState::Ready {
                return;
            }

            match recv_frame(&mut conn.stream, self.capacity, &mut conn.cursor) {
                Ok(RecvStatus::Complete(frame)) => {
                    conn.received += 1;
                    if frame.clamped() {
                        self.sink.emit(
                            Category::Warning,
                            &format!(
                                "invalid message header (port {port}): len = {}, ix = {}",
                                frame.declared, frame.seq
                            ),
                        );
                    }
                    let text = String::from_utf8_lossy(&frame.payload);
                    self.sink.emit(Category::Received, &preview(&text));
                }
                Ok(RecvStatus::Blocked) => return,
                Ok(RecvStatus::Terminated) => {
                    self.sink.emit(
                        Category::Socket,
                        &format!("socket recv (port {port}) terminated connection"),
                    );
                    self.remove_connection(port);
                    return;
                }
                Err(e) => {
                    self.sink
                        .emit(Category::Error, &format!("socket recv (port {port}): {e}"));
                    self.remove_connection(port);
                    return;
                }
            }
        }
    }

    /// The `#d` dump: both registries, including queued messages.
    fn show_connections(&mut self) {
        self.sink.emit(
            Category::Query,
            &format!("client connections ({}):", self.registry.len()),
        );
        for conn in self.registry.iter() {
            self.sink.emit(
                Category::Query,
                &format!(
                    "  destport {}, sendport {}, state {}, msgs ({}:{}:{}) blocked {}, queued {}",
                    conn.dest_port,
                    conn.send_port.unwrap_or(0),
                    conn.state,
                    conn.produced,
                    conn.sent,
                    conn.received,
                    conn.blocked,
                    conn.queue.len()
                ),
            );
            for msg in conn.queue.iter() {
                self.sink.emit(
                    Category::Query,
                    &format!("      {} : {}", msg.seq, String::from_utf8_lossy(&msg.payload)),
                );
            }
        }

        self.sink.emit(
            Category::Query,
            &format!(
                "server connections ({} active):",
                self.supervisor.active_count()
            ),
        );
        for record in self.supervisor.workers() {
            self.sink.emit(
                Category::Query,
                &format!(
                    "  client port {}, worker {} ({})",
                    record.client_port,
                    record.id,
                    if record.active { "active" } else { "stopped" }
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::{encode_header, send_frame, SendStatus};
    use crate::sink::MemorySink;
    use std::io::Read;
    use std::sync::mpsc;

    fn test_dispatcher(sink: Arc<MemorySink>) -> (Dispatcher, mpsc::Sender<Command>) {
        let config = Config {
            port: 0,
            host: "127.0.0.1".to_string(),
            max_message: 255,
            tick_ms: 20,
            log_level: "info".to_string(),
        };
        let (tx, rx) = mpsc::channel();
        let (dispatcher, _waker) = Dispatcher::new(&config, rx, sink).unwrap();
        (dispatcher, tx)
    }

    /// One hand-driven loop cycle: poll, reap, commands, connection events.
    fn run_cycle(dispatcher: &mut Dispatcher) {
        dispatcher
            .poll
            .poll(&mut dispatcher.events, Some(Duration::from_millis(20)))
            .unwrap();
        dispatcher.supervisor.reap();
        assert!(dispatcher.drain_commands());
        let mut ready = Vec::new();
        for event in dispatcher.events.iter() {
            let Token(p) = event.token();
            if p < usize::MAX - 1 {
                ready.push((p as u16, event.is_writable(), event.is_readable()));
            }
        }
        for (port, writable, readable) in ready {
            if writable {
                dispatcher.connection_writable(port);
            }
            if readable {
                dispatcher.connection_readable(port);
            }
        }
    }

    #[test]
    fn test_add_to_dead_port_reports_connect_error() {
        // Scenario A: no listener behind the destination port. The connect
        // starts PENDING, resolves to a failure on write-readiness, and the
        // connection is removed with an error naming the port.
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, tx) = test_dispatcher(sink.clone());

        // a port nothing listens on: bind-then-drop reserves and releases it
        let dead_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        tx.send(Command::AddEndpoint(dead_port)).unwrap();

        // on loopback the refusal may surface synchronously from connect or
        // asynchronously through write-readiness; both end with the
        // connection gone and an event naming the port
        for _ in 0..50 {
            run_cycle(&mut dispatcher);
            if dispatcher.registry.is_empty() {
                break;
            }
        }

        assert!(dispatcher.registry.is_empty());
        let mut reported = sink.messages(Category::Socket);
        reported.extend(sink.messages(Category::Error));
        assert!(
            reported.iter().any(|m| m.contains("connect")
                && m.contains(&format!("port {dead_port}"))),
            "reported events: {reported:?}"
        );
    }

    #[test]
    fn test_outbound_framing_and_echo_on_loopback() {
        // A live peer accepts the outbound connection: the pending connect
        // resolves on write-readiness, the queued message flushes with the
        // exact frame bytes, and the echo bumps the receive counter.
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, tx) = test_dispatcher(sink.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dest_port = listener.local_addr().unwrap().port();

        tx.send(Command::AddEndpoint(dest_port)).unwrap();
        tx.send(Command::SendMessage("hello".to_string())).unwrap();

        // first cycle starts the connect and queues the message
        run_cycle(&mut dispatcher);
        let (mut peer, _) = listener.accept().unwrap();

        for _ in 0..50 {
            run_cycle(&mut dispatcher);
            let conn = dispatcher.registry.find_mut(dest_port).unwrap();
            if conn.state == ConnState::Ready && conn.sent == 1 {
                break;
            }
        }

        // exactly header(len 5, seq 1) + payload on the wire
        let mut wire = [0u8; 13];
        peer.read_exact(&mut wire).unwrap();
        let mut expected = encode_header(5, 1).to_vec();
        expected.extend_from_slice(b"hello");
        assert_eq!(&wire[..], &expected[..]);

        {
            let conn = dispatcher.registry.find_mut(dest_port).unwrap();
            assert_eq!(conn.state, ConnState::Ready);
            assert_eq!(conn.sent, 1);
            assert!(conn.send_port.is_some());
        }

        // echo a frame back; the dispatcher's read side decodes it
        let status = send_frame(&mut peer, b"1: hello", 1, 0).unwrap();
        assert_eq!(status, SendStatus::Complete);
        for _ in 0..50 {
            run_cycle(&mut dispatcher);
            if dispatcher.registry.find_mut(dest_port).unwrap().received == 1 {
                break;
            }
        }
        assert_eq!(
            dispatcher.registry.find_mut(dest_port).unwrap().received,
            1
        );

        let received = sink.messages(Category::Received);
        assert!(received.iter().any(|m| m.contains("1: hello")));
    }

    #[test]
    fn test_quit_command_stops_the_loop() {
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, tx) = test_dispatcher(sink.clone());

        tx.send(Command::Quit).unwrap();
        dispatcher.run().unwrap();

        let queries = sink.messages(Category::Query);
        assert!(queries.iter().any(|m| m.contains("exiting")));
    }

    #[test]
    fn test_send_without_selection_is_an_error() {
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, _tx) = test_dispatcher(sink.clone());

        dispatcher.send_to_selected(Bytes::from_static(b"nowhere to go"));

        let errors = sink.messages(Category::Error);
        assert!(errors.iter().any(|m| m.contains("No active connection")));
    }

    #[test]
    fn test_commands_cancel_test_burst() {
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, tx) = test_dispatcher(sink);

        dispatcher.ctx.test_remaining = 500;
        tx.send(Command::ShowConnections).unwrap();
        assert!(dispatcher.drain_commands());
        assert_eq!(dispatcher.ctx.test_remaining, 0);
    }

    #[test]
    fn test_remove_unknown_port_is_reported() {
        let sink = Arc::new(MemorySink::new());
        let (mut dispatcher, _tx) = test_dispatcher(sink.clone());

        dispatcher.remove_connection(4242);

        let errors = sink.messages(Category::Error);
        assert!(errors.iter().any(|m| m.contains("4242 not found")));
    }
}
