//! The event loop.
//!
//! A single thread multiplexes the listener and every client socket with a
//! readiness poll. Each iteration: wait up to a second, accept, drain
//! readable sockets (submitting one dispatcher task per complete frame),
//! sweep idle connections when the wait timed out with no events, then sweep
//! the pending-removal list. Teardown is always two-phase: handlers and the
//! reader only mark; this loop deregisters and closes.

use crate::context::ServerContext;
use crate::dispatch;
use crate::net::codec::FrameError;
use crate::pool::WorkerPool;
use crate::snapshot;
use crate::ClientId;
use ember::logging::{self, Logger};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const EVENT_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 4096;

/// Connections silent for longer than this are torn down.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    log: Logger,
}

impl EventLoop {
    /// Bind the listener and set up the poll. Failure here is fatal; the
    /// caller exits nonzero.
    pub fn bind(
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
        pool: WorkerPool,
        log: &Logger,
    ) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            ctx,
            pool,
            log: log.new(logging::o!("mod" => "server")),
        })
    }

    /// Run until the shutdown flag is raised.
    pub fn run(&mut self) -> io::Result<()> {
        logging::info!(self.log, "server listening"; "addr" => %self.listener.local_addr()?);

        while !self.ctx.shutdown.load(Ordering::SeqCst) {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            if self.events.is_empty() {
                self.sweep_heartbeats(Instant::now());
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    LISTENER => self.accept_clients(),
                    Token(raw) => self.drain_client(raw as ClientId),
                }
            }

            self.sweep_pending();
        }

        logging::info!(self.log, "shutdown requested, leaving event loop");
        Ok(())
    }

    /// Accept every queued connection, register it for read readiness and
    /// insert it into the connection table.
    fn accept_clients(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let addr = peer.to_string();
                    let id = self.ctx.clients.insert(stream, addr.clone());
                    let registered = self.ctx.clients.with_conn_mut(id, |conn| {
                        self.poll.registry().register(
                            &mut conn.stream,
                            Token(id as usize),
                            Interest::READABLE,
                        )
                    });
                    match registered {
                        Some(Ok(())) => {
                            logging::info!(self.log, "client connected";
                                           "client_id" => id, "peer" => addr.as_str());
                        }
                        Some(Err(err)) => {
                            logging::error!(self.log, "cannot register accepted client";
                                            "client_id" => id, "error" => %err);
                            self.ctx.clients.mark_for_removal(id);
                        }
                        None => {}
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Drain a readable socket, submitting one dispatcher task per complete
    /// frame. EOF, a nonrecoverable read error or a framing violation mark
    /// the connection for teardown.
    fn drain_client(&self, id: ClientId) {
        let mut complete = Vec::new();
        let mut failed = false;
        let mut scratch = [0u8; READ_CHUNK];

        let present = self.ctx.clients.with_conn_mut(id, |conn| {
            loop {
                match conn.stream.read(&mut scratch) {
                    Ok(0) => {
                        failed = true;
                        break;
                    }
                    Ok(count) => conn.decoder.extend(&scratch[..count]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        logging::warn!(self.log, "read failed";
                                       "client_id" => id, "error" => %err);
                        failed = true;
                        break;
                    }
                }
            }

            loop {
                match conn.decoder.next_frame() {
                    Ok(Some(payload)) => {
                        conn.last_activity = Instant::now();
                        complete.push(payload);
                    }
                    Ok(None) => break,
                    Err(FrameError::Encoding) => {
                        logging::warn!(self.log, "malformed frame, dropping connection";
                                       "client_id" => id);
                        failed = true;
                        break;
                    }
                }
            }
        });

        // Stale readiness event for an already removed connection.
        if present.is_none() {
            return;
        }

        for payload in complete {
            let ctx = Arc::clone(&self.ctx);
            self.pool
                .submit(move || dispatch::handle_message(&ctx, id, &payload));
        }

        if failed {
            self.ctx.disconnect_client(id);
        }
    }

    /// Mark every connection whose last activity predates the heartbeat
    /// threshold. Runs only when the poll timed out with no events.
    fn sweep_heartbeats(&self, now: Instant) {
        for id in self.ctx.clients.idle_ids(HEARTBEAT_TIMEOUT, now) {
            logging::info!(self.log, "client timed out, disconnecting";
                           "client_id" => id, "idle_threshold_secs" => HEARTBEAT_TIMEOUT.as_secs());
            self.ctx.disconnect_client(id);
        }
    }

    /// Perform the deferred teardown: deregister from the poll, erase from
    /// the connection table, close the socket.
    fn sweep_pending(&self) {
        for id in self.ctx.clients.drain_pending() {
            if let Some(mut conn) = self.ctx.clients.remove(id) {
                if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
                    logging::warn!(self.log, "deregister failed during teardown";
                                   "client_id" => id, "error" => %err);
                }
                logging::info!(self.log, "client cleaned up";
                               "client_id" => id, "peer" => conn.addr.as_str());
            }
        }
    }

    /// Graceful shutdown: stop accepting, drain the worker pool, disconnect
    /// the credential store, save the group snapshot, close all sockets.
    pub fn shutdown(self, snapshot_path: &Path) {
        let EventLoop { listener, ctx, mut pool, log, .. } = self;
        drop(listener);

        pool.shutdown();
        ctx.store.disconnect();

        let groups = ctx.groups.snapshot();
        if let Err(err) = snapshot::save(snapshot_path, &groups, &log) {
            logging::error!(log, "group snapshot save failed, continuing shutdown";
                            "error" => %err);
        }

        let closed = ctx.clients.clear_all();
        logging::info!(log, "server stopped"; "closed_connections" => closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CommandTables;
    use crate::groups::{GroupManager, GroupMap};
    use crate::net::codec::encode_frame;
    use crate::net::registry::ClientRegistry;
    use crate::script::ScriptBridge;
    use crate::store::MemoryStore;
    use crate::testutil::{loopback_pair, read_frame, test_logger};
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::AtomicBool;

    fn test_context() -> Arc<ServerContext> {
        let log = test_logger();
        let clients = Arc::new(ClientRegistry::new(&log));
        Arc::new(ServerContext {
            groups: GroupManager::new(GroupMap::new(), Arc::clone(&clients), &log),
            scripts: ScriptBridge::new(Arc::clone(&clients), &log).unwrap(),
            commands: CommandTables::new(),
            store: Box::new(MemoryStore::new()),
            clients,
            log,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn test_event_loop(ctx: Arc<ServerContext>) -> EventLoop {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let pool = WorkerPool::new(1, &test_logger());
        EventLoop::bind(addr, ctx, pool, &test_logger()).unwrap()
    }

    fn connect(ctx: &ServerContext) -> (ClientId, StdTcpStream) {
        let (stream, peer) = loopback_pair();
        let id = ctx.clients.insert(stream, "127.0.0.1:1".to_string());
        (id, peer)
    }

    #[test]
    fn test_accept_inserts_into_table() {
        let ctx = test_context();
        let event_loop = test_event_loop(Arc::clone(&ctx));
        let addr = event_loop.listener.local_addr().unwrap();

        let _client = StdTcpStream::connect(addr).unwrap();
        // Give the kernel a beat to finish the handshake before accepting.
        std::thread::sleep(Duration::from_millis(50));
        event_loop.accept_clients();

        assert_eq!(ctx.clients.snapshot_ids().len(), 1);
    }

    #[test]
    fn test_idle_connection_lands_in_pending_after_sweep() {
        let ctx = test_context();
        let event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, _peer) = connect(&ctx);

        event_loop.sweep_heartbeats(Instant::now());
        assert!(ctx.clients.drain_pending().is_empty());

        event_loop.sweep_heartbeats(Instant::now() + HEARTBEAT_TIMEOUT + Duration::from_secs(1));
        assert_eq!(ctx.clients.drain_pending(), vec![id]);
    }

    #[test]
    fn test_sweep_pending_removes_and_closes() {
        let ctx = test_context();
        let event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, mut peer) = connect(&ctx);

        ctx.clients.mark_for_removal(id);
        event_loop.sweep_pending();

        assert!(ctx.clients.snapshot_ids().is_empty());
        let mut probe = [0u8; 1];
        assert_eq!(peer.read(&mut probe).unwrap(), 0, "peer should observe EOF");
    }

    #[test]
    fn test_drain_client_dispatches_complete_frames() {
        let ctx = test_context();
        let mut event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, mut peer) = connect(&ctx);

        peer.write_all(&encode_frame("not a command")).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        event_loop.drain_client(id);
        event_loop.pool.shutdown();

        // Unauthenticated traffic earns the usage reply.
        let reply = read_frame(&mut peer);
        assert!(reply.starts_with("请先登录。"), "got: {}", reply);
    }

    #[test]
    fn test_drain_client_partial_frame_waits() {
        let ctx = test_context();
        let mut event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, mut peer) = connect(&ctx);
        let frame = encode_frame("split across reads");

        peer.write_all(&frame[..3]).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        event_loop.drain_client(id);

        let pending = ctx.clients.with_conn_mut(id, |conn| conn.decoder.pending());
        assert_eq!(pending, Some(3));

        peer.write_all(&frame[3..]).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        event_loop.drain_client(id);
        event_loop.pool.shutdown();

        let reply = read_frame(&mut peer);
        assert!(reply.starts_with("请先登录。"), "got: {}", reply);
    }

    #[test]
    fn test_drain_client_eof_marks_for_teardown() {
        let ctx = test_context();
        let event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, peer) = connect(&ctx);

        drop(peer);
        std::thread::sleep(Duration::from_millis(50));
        event_loop.drain_client(id);

        assert_eq!(ctx.clients.drain_pending(), vec![id]);
    }

    #[test]
    fn test_malformed_frame_marks_for_teardown() {
        let ctx = test_context();
        let event_loop = test_event_loop(Arc::clone(&ctx));
        let (id, mut peer) = connect(&ctx);

        peer.write_all(&[0, 0, 0, 2, 0xff, 0xfe]).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        event_loop.drain_client(id);

        assert_eq!(ctx.clients.drain_pending(), vec![id]);
    }

    #[test]
    fn test_shutdown_saves_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups_data.json");
        let ctx = test_context();
        ctx.groups.create("Alice", &["club"]);
        let event_loop = test_event_loop(Arc::clone(&ctx));

        event_loop.shutdown(&path);

        let reloaded = snapshot::load(&path, &test_logger());
        assert!(reloaded.contains_key("club"));
    }
}
