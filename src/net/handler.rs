//! Accept loop, per-endpoint receivers and the packet dispatcher.
//!
//! Threading model: the accept loop runs on the caller's thread, one receiver
//! thread per endpoint feeds the shared FIFO, and a single dispatcher thread
//! drains it and runs handlers serially. The application context value moves
//! into the dispatcher thread, so handlers mutate it without any locking —
//! the dispatcher is the only writer.
//!
//! Ordering: packets from one endpoint are enqueued in receive order and the
//! drain preserves FIFO order, so per-endpoint dispatch order matches receive
//! order. Packets from distinct endpoints interleave nondeterministically.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::net::conn::{Connection, SOCKET_TIMEOUT};
use crate::net::endpoint::Endpoint;
use crate::net::packet::{Packet, PacketType};

/// A server-side packet handler. Returning an error sends it back to the
/// originating endpoint as an `Err` packet; on success the handler is
/// responsible for its own acknowledgement.
pub type PacketDelegate<C> = fn(&mut C, &Endpoint, Packet) -> Result<()>;

type PacketQueue = Arc<Mutex<VecDeque<(Endpoint, Packet)>>>;
type EndpointList = Arc<Mutex<Vec<Endpoint>>>;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DISPATCH_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// The endpoint session server: accepts peers, runs their receive loops and
/// dispatches queued packets to type-indexed handlers.
pub struct NetHandler<C> {
    listener: TcpListener,
    run: Arc<AtomicBool>,
    queue: PacketQueue,
    endpoints: EndpointList,
    handlers: HashMap<PacketType, PacketDelegate<C>>,
    dispatcher: Option<JoinHandle<()>>,
    receivers: Vec<JoinHandle<()>>,
}

/// Cloneable handle that stops a running [`NetHandler`] from another thread.
#[derive(Clone)]
pub struct StopHandle {
    run: Arc<AtomicBool>,
    endpoints: EndpointList,
}

impl StopHandle {
    /// Flip the run flag and shut down every endpoint socket so receiver
    /// threads unblock. The accept loop exits on its next poll.
    pub fn stop(&self) {
        self.run.store(false, Ordering::Relaxed);
        for ep in self.endpoints.lock().iter() {
            ep.conn().shutdown();
        }
    }
}

impl<C: Send + 'static> NetHandler<C> {
    pub fn new(listener: TcpListener) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::with_message(ErrorKind::NetListenFailure, e.to_string()))?;
        Ok(Self {
            listener,
            run: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            endpoints: Arc::new(Mutex::new(Vec::new())),
            handlers: HashMap::new(),
            dispatcher: None,
            receivers: Vec::new(),
        })
    }

    /// Register a handler for a packet type. Last registration wins.
    pub fn add_packet(&mut self, ty: PacketType, delegate: PacketDelegate<C>) {
        self.handlers.insert(ty, delegate);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            run: Arc::clone(&self.run),
            endpoints: Arc::clone(&self.endpoints),
        }
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Spawn the dispatcher thread. Takes ownership of the handler table and
    /// the application context; register handlers first.
    pub fn begin_packet_dispatch(&mut self, mut ctx: C) -> Result<()> {
        let handlers = std::mem::take(&mut self.handlers);
        let run = Arc::clone(&self.run);
        let queue = Arc::clone(&self.queue);

        let handle = thread::Builder::new()
            .name("packet-dispatcher".to_string())
            .spawn(move || {
                while run.load(Ordering::Relaxed) {
                    // Drain under the lock, execute outside it. The batch
                    // keeps FIFO order, so per-endpoint ordering holds.
                    let batch: Vec<(Endpoint, Packet)> = queue.lock().drain(..).collect();
                    if batch.is_empty() {
                        thread::sleep(DISPATCH_IDLE_SLEEP);
                        continue;
                    }
                    for (ep, packet) in batch {
                        let ty = packet.packet_type();
                        match handlers.get(&ty) {
                            Some(delegate) => {
                                if let Err(err) = delegate(&mut ctx, &ep, packet) {
                                    error!("An error occurred!\n\t{err}");
                                    if let Err(send_err) = ep.send(Packet::from(&err)) {
                                        warn!(
                                            "EP#{}: failed to deliver error reply: {send_err}",
                                            ep.id()
                                        );
                                    }
                                }
                            }
                            None => info!("Dropped {} packet.", ty.name()),
                        }
                    }
                }
                debug!("packet dispatcher exiting");
            })
            .map_err(|e| Error::with_message(ErrorKind::IOError, e.to_string()))?;

        self.dispatcher = Some(handle);
        Ok(())
    }

    /// Accept and register peers until stopped. Blocks the calling thread.
    pub fn begin_accept(&mut self) -> Result<()> {
        info!("Waiting for an endpoint...");
        while self.run.load(Ordering::Relaxed) {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    error!("Accept error: {e}");
                    continue;
                }
            };

            info!("A connection is being made by ({addr})...");
            let conn = Connection::from_stream(stream);
            let Some(endpoint) = self.handshake(conn, addr) else {
                continue;
            };

            let ep_id = endpoint.id();
            info!("EP#{ep_id} connected as ({addr}).");
            self.endpoints.lock().push(endpoint.clone());

            let queue = Arc::clone(&self.queue);
            let endpoints = Arc::clone(&self.endpoints);
            let spawned = thread::Builder::new()
                .name(format!("ep-recv-{ep_id}"))
                .spawn(move || receive_loop(endpoint, queue, endpoints));
            match spawned {
                Ok(handle) => self.receivers.push(handle),
                Err(e) => error!("EP#{ep_id}: failed to spawn receiver: {e}"),
            }
            info!("Waiting for an endpoint...");
        }
        Ok(())
    }

    /// Run the registration handshake on a fresh connection. Any deviation —
    /// timeout, a first packet that is not `Ready`, a malformed payload, a
    /// failed acknowledgement — drops the socket and keeps the server going.
    fn handshake(&self, conn: Connection, addr: SocketAddr) -> Option<Endpoint> {
        info!("Waiting for a Ready packet from ({addr})...");
        if conn.set_read_timeout(Some(SOCKET_TIMEOUT)).is_err() {
            conn.shutdown();
            return None;
        }

        let mut ready = match conn.receive() {
            Ok(packet) => packet,
            Err(_) => {
                error!("({addr}) failed to respond with a Ready packet! Disconnecting...");
                conn.shutdown();
                return None;
            }
        };
        if ready.packet_type() != PacketType::Ready {
            error!(
                "({addr}) opened with a {} packet instead of Ready! Disconnecting...",
                ready.packet_type().name()
            );
            conn.shutdown();
            return None;
        }
        let id = match ready.pop_u8() {
            Ok(id) => id,
            Err(err) => {
                error!("({addr}) sent a malformed Ready packet: {err}");
                conn.shutdown();
                return None;
            }
        };

        // Back to fully blocking reads for the session's receive loop.
        if conn.set_read_timeout(None).is_err() || conn.send(&Packet::ok()).is_err() {
            error!("EP#{id}: failed to acknowledge registration");
            conn.shutdown();
            return None;
        }
        Some(Endpoint::new(id, conn))
    }
}

/// Per-endpoint receive loop: block on the socket, enqueue every packet with
/// a handle to its origin, exit on the first receive failure (including clean
/// EOF).
fn receive_loop(endpoint: Endpoint, queue: PacketQueue, endpoints: EndpointList) {
    while endpoint.is_connected() {
        match endpoint.conn().receive() {
            Ok(packet) => queue.lock().push_back((endpoint.clone(), packet)),
            Err(_) => break,
        }
    }
    let id = endpoint.id();
    endpoints.lock().retain(|ep| ep.id() != id);
    debug!("EP#{id} disconnected");
}

impl<C> Drop for NetHandler<C> {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Relaxed);
        for ep in self.endpoints.lock().iter() {
            ep.conn().shutdown();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        for handle in self.receivers.drain(..) {
            let _ = handle.join();
        }
    }
}
