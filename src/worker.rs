//! Per-connection echo worker.
//!
//! One worker owns exactly one accepted socket plus its own receive cursor,
//! counters, and send queue; nothing is shared with the dispatcher or with
//! other workers. Every complete inbound frame is echoed back tagged with
//! this connection's receive count.
//!
//! Unlike the dispatcher, the worker attempts to drain its send queue on
//! every loop iteration whether or not the socket reported write-readiness.
//! An enqueue can happen while the socket is already writable, in which
//! case no further writable edge would arrive; the unconditional drain
//! trades a little wasted effort for forward progress.

use crate::net::frame::{recv_frame, RecvCursor, RecvStatus};
use crate::queue::SendQueue;
use crate::sink::{preview, Category, LogSink};
use crate::supervisor::WorkerId;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIENT: Token = Token(0);

const TICK: Duration = Duration::from_secs(1);

/// Worker entry point; runs until the peer closes or the socket fails.
pub fn run(
    mut stream: TcpStream,
    client_port: u16,
    recv_delay: bool,
    capacity: usize,
    id: WorkerId,
    sink: Arc<dyn LogSink>,
) {
    if let Err(e) = serve(&mut stream, client_port, recv_delay, capacity, id, &*sink) {
        sink.emit(
            Category::Error,
            &format!("worker {id} (port {client_port}): {e}"),
        );
    }
    sink.emit(Category::Other, &format!("worker {id} terminating"));
}

fn serve(
    stream: &mut TcpStream,
    client_port: u16,
    recv_delay: bool,
    capacity: usize,
    id: WorkerId,
    sink: &dyn LogSink,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(8);
    poll.registry()
        .register(stream, CLIENT, Interest::READABLE | Interest::WRITABLE)?;

    let mut cursor = RecvCursor::default();
    let mut queue = SendQueue::new();
    let mut recv_count: u32 = 0;

    loop {
        if let Err(e) = poll.poll(&mut events, Some(TICK)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let readable = events
            .iter()
            .any(|e| e.token() == CLIENT && e.is_readable());

        if readable {
            // drain the socket completely; with edge-triggered readiness a
            // partial read would silently strand the rest
            loop {
                match recv_frame(stream, capacity, &mut cursor)? {
                    RecvStatus::Complete(frame) => {
                        recv_count += 1;
                        if frame.clamped() {
                            sink.emit(
                                Category::Warning,
                                &format!(
                                    "invalid message header (port {client_port}): len = {}, ix = {}",
                                    frame.declared, frame.seq
                                ),
                            );
                        }
                        let text = String::from_utf8_lossy(&frame.payload);
                        sink.emit(
                            Category::Sent,
                            &format!(
                                "worker {id} [port {client_port} msg {recv_count}] : {}",
                                preview(&text)
                            ),
                        );

                        let response = format!("{recv_count}: {text}");
                        queue.push(recv_count, Bytes::from(response));

                        // artificial throttle to provoke send backpressure
                        // on the peer (#z)
                        if recv_delay {
                            thread::sleep(Duration::from_secs(1));
                        }
                    }
                    RecvStatus::Blocked => break,
                    RecvStatus::Terminated => {
                        sink.emit(
                            Category::Socket,
                            &format!(
                                "socket recv (port {client_port}) worker {id} terminated connection"
                            ),
                        );
                        return Ok(());
                    }
                }
            }
        }

        let outcome = queue.drain(stream)?;
        if outcome.blocked {
            sink.emit(
                Category::Error,
                &format!("socket send (port {client_port}): blocked"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::{encode_header, send_frame, RecvCursor, SendStatus};
    use crate::sink::MemorySink;
    use std::io::Write;
    use std::net::TcpListener;

    fn connected_pair() -> (std::net::TcpStream, TcpStream, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(accepted), peer.port())
    }

    #[test]
    fn test_worker_echoes_with_receive_counter() {
        let (mut client, worker_stream, peer_port) = connected_pair();
        let sink = Arc::new(MemorySink::new());
        let sink_for_worker: Arc<dyn LogSink> = sink.clone();

        let handle = thread::spawn(move || {
            run(worker_stream, peer_port, false, 255, 1, sink_for_worker);
        });

        // two frames from the client side, blocking socket
        for (seq, text) in [(1u32, "hello"), (2u32, "again")] {
            let status = send_frame(&mut client, text.as_bytes(), seq, 0).unwrap();
            assert_eq!(status, SendStatus::Complete);
        }

        // read both echoes back; client socket is blocking so plain reads
        // suffice
        let mut cursor = RecvCursor::default();
        let first = loop {
            match recv_frame(&mut client, 255, &mut cursor).unwrap() {
                RecvStatus::Complete(frame) => break frame,
                RecvStatus::Blocked => continue,
                RecvStatus::Terminated => panic!("worker closed early"),
            }
        };
        assert_eq!(first.seq, 1);
        assert_eq!(&first.payload[..], b"1: hello");

        let second = loop {
            match recv_frame(&mut client, 255, &mut cursor).unwrap() {
                RecvStatus::Complete(frame) => break frame,
                RecvStatus::Blocked => continue,
                RecvStatus::Terminated => panic!("worker closed early"),
            }
        };
        assert_eq!(second.seq, 2);
        assert_eq!(&second.payload[..], b"2: again");

        drop(client);
        handle.join().unwrap();

        let echoes = sink.messages(Category::Sent);
        assert_eq!(echoes.len(), 2);
        assert!(echoes[0].contains("msg 1"));
    }

    #[test]
    fn test_worker_exits_on_peer_close() {
        let (client, worker_stream, peer_port) = connected_pair();
        let sink = Arc::new(MemorySink::new());
        let sink_for_worker: Arc<dyn LogSink> = sink.clone();

        let handle = thread::spawn(move || {
            run(worker_stream, peer_port, false, 255, 7, sink_for_worker);
        });

        drop(client);
        handle.join().unwrap();

        let socket_events = sink.messages(Category::Socket);
        assert!(socket_events
            .iter()
            .any(|m| m.contains("terminated connection")));
    }

    #[test]
    fn test_worker_survives_oversized_header() {
        let (mut client, worker_stream, peer_port) = connected_pair();
        let sink = Arc::new(MemorySink::new());
        let sink_for_worker: Arc<dyn LogSink> = sink.clone();

        let handle = thread::spawn(move || {
            run(worker_stream, peer_port, false, 16, 3, sink_for_worker);
        });

        // header claims far more than the worker's capacity of 16
        let payload = vec![b'z'; 200];
        let mut wire = encode_header(payload.len() as u32, 1).to_vec();
        wire.extend_from_slice(&payload);
        client.write_all(&wire).unwrap();

        // the clamped echo still comes back and the connection stays up
        let mut cursor = RecvCursor::default();
        let echo = loop {
            match recv_frame(&mut client, 255, &mut cursor).unwrap() {
                RecvStatus::Complete(frame) => break frame,
                RecvStatus::Blocked => continue,
                RecvStatus::Terminated => panic!("worker dropped the connection"),
            }
        };
        assert!(echo.payload.starts_with(b"1: "));

        drop(client);
        handle.join().unwrap();

        let warnings = sink.messages(Category::Warning);
        assert!(warnings.iter().any(|m| m.contains("invalid message header")));
    }
}
