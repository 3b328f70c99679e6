//! Worker lifecycle tracking.
//!
//! Each accepted inbound connection is delegated to its own worker thread.
//! The supervisor records the worker at spawn time and learns about its
//! death through an explicit exit-notification channel that the dispatcher
//! drains once per loop cycle; nothing mutates the registry from another
//! thread. Records stay around as `stopped` until the process exits.

use crate::sink::{Category, LogSink};
use crate::worker;
use mio::net::TcpStream;
use mio::Waker;
use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

pub type WorkerId = u64;

/// Liveness record for one spawned worker.
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Port of the client the worker is serving.
    pub client_port: u16,
    pub active: bool,
}

pub struct Supervisor {
    next_id: WorkerId,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    exit_tx: Sender<WorkerId>,
    exit_rx: Receiver<WorkerId>,
    waker: Arc<Waker>,
    sink: Arc<dyn LogSink>,
}

impl Supervisor {
    pub fn new(waker: Arc<Waker>, sink: Arc<dyn LogSink>) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel();
        Self {
            next_id: 1,
            workers: BTreeMap::new(),
            exit_tx,
            exit_rx,
            waker,
            sink,
        }
    }

    /// Hand an accepted connection to a new worker thread and record it.
    ///
    /// The stream moves into the worker entirely; the dispatcher keeps no
    /// handle to it. A spawn failure leaves no record behind.
    pub fn spawn(
        &mut self,
        stream: TcpStream,
        client_port: u16,
        recv_delay: bool,
        capacity: usize,
    ) -> io::Result<WorkerId> {
        let id = self.next_id;
        let exit_tx = self.exit_tx.clone();
        let waker = Arc::clone(&self.waker);
        let sink = Arc::clone(&self.sink);

        thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                worker::run(stream, client_port, recv_delay, capacity, id, sink);
                let _ = exit_tx.send(id);
                let _ = waker.wake();
            })?;

        self.next_id += 1;
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                client_port,
                active: true,
            },
        );
        Ok(id)
    }

    /// Drain pending exit notifications, flipping matching records to
    /// stopped. Never blocks; called once per dispatcher cycle.
    pub fn reap(&mut self) {
        while let Ok(id) = self.exit_rx.try_recv() {
            if let Some(record) = self.workers.get_mut(&id) {
                record.active = false;
                self.sink.emit(
                    Category::Other,
                    &format!("worker {id} (port {}) stopped", record.client_port),
                );
            }
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn active_count(&self) -> usize {
        self.workers.values().filter(|w| w.active).count()
    }
}
