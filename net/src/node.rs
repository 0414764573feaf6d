//! The node: owns the listener, the peer pool, the object store, and the
//! inventory index, and spawns the accept and garbage-collection loops.
//! Generalized from `node-handshake`'s `Node` (single `HashMap<SocketAddr,
//! NodeConnection>`, one-shot `connect_with`) into the always-on,
//! multi-peer relay spec.md §4.6 describes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashSet;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::AbortHandle;

use crate::connection::run_connection;
use crate::error::{PeerError, PeerResult, StoreResult};
use crate::store::{load_index, run_gc, ObjectStore};
use crate::wire_protocol::{AddrMessage, InventoryVector, ProtocolMessage, VersionMessage};

/// Static configuration the node needs to build its own `version` message
/// and to admit incoming objects.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub store_path: String,
    pub user_agent: String,
    pub pow_target: u64,
}

struct PeerHandle {
    remote_addr: SocketAddr,
    outbound_tx: mpsc::Sender<ProtocolMessage>,
    reader_abort: AbortHandle,
    writer_abort: AbortHandle,
}

/// The narrow capability a connection task is given. Holding this instead
/// of the `Node` itself avoids a connection-task -> pool -> connection-task
/// ownership cycle (spec.md §9).
#[derive(Clone)]
pub struct NodeHandle {
    store: Arc<ObjectStore>,
    index: Arc<DashSet<InventoryVector>>,
    pool: Arc<RwLock<HashMap<u64, PeerHandle>>>,
    pow_target: u64,
}

impl NodeHandle {
    pub fn pow_target(&self) -> u64 {
        self.pow_target
    }

    pub async fn peer_nonces(&self) -> Vec<u64> {
        self.pool.read().await.keys().copied().collect()
    }

    pub fn index_contains(&self, vector: &InventoryVector) -> bool {
        self.index.contains(vector)
    }

    pub fn missing_vectors(&self, received: &[InventoryVector]) -> Vec<InventoryVector> {
        received.iter().filter(|v| !self.index.contains(*v)).copied().collect()
    }

    pub fn get_object(&self, vector: &InventoryVector) -> StoreResult<Option<Vec<u8>>> {
        self.store.get(vector)
    }

    pub fn store_snapshot(&self) -> Vec<InventoryVector> {
        self.index.iter().map(|v| *v).collect()
    }

    /// Stores the object and makes it visible in the index before
    /// returning, so a broadcast issued right after this call can never
    /// race a peer's `inv` query that would otherwise miss it.
    pub fn store_object(&self, vector: InventoryVector, body: Vec<u8>) -> StoreResult<()> {
        self.store.put(&vector, &body)?;
        self.index.insert(vector);
        Ok(())
    }

    pub fn emit_addr_gossip(&self, addr: AddrMessage) {
        for entry in addr.addresses {
            log::debug!("addr gossip: {:?}", entry);
        }
    }

    /// Forwards via `try_send`: this is called from a connection's own
    /// dispatcher task, so blocking on another peer's full outbound queue
    /// risks a cross-connection stall. A dropped `inv` is re-announced next
    /// time the object is seen, so dropping here is safe.
    pub async fn broadcast_inv(&self, vector: InventoryVector, exclude_peer: u64) {
        let message = ProtocolMessage::Inv(crate::wire_protocol::InvMessage { vectors: vec![vector] });
        let peers = self.pool.read().await;
        for (nonce, peer) in peers.iter() {
            if *nonce == exclude_peer {
                continue;
            }
            if let Err(err) = peer.outbound_tx.try_send(message.clone()) {
                log::debug!("could not forward inv to peer {} ({}): {}", nonce, peer.remote_addr, err);
            }
        }
    }

    pub(crate) async fn register_peer(
        &self,
        nonce: u64,
        remote_addr: SocketAddr,
        outbound_tx: mpsc::Sender<ProtocolMessage>,
        reader_abort: AbortHandle,
        writer_abort: AbortHandle,
    ) {
        let mut peers = self.pool.write().await;
        let peer = PeerHandle { remote_addr, outbound_tx, reader_abort, writer_abort };
        if let Some(old) = peers.insert(nonce, peer) {
            log::info!("peer nonce {} reconnected from {}, replacing old connection from {}", nonce, remote_addr, old.remote_addr);
        }
    }

    pub(crate) async fn deregister_peer(&self, nonce: u64) {
        self.pool.write().await.remove(&nonce);
    }
}

/// Owns the overlay node's listener, peer pool, store, and inventory index.
pub struct Node {
    config: NodeConfig,
    nonce: u64,
    handle: NodeHandle,
    shutdown: Arc<AtomicBool>,
    accept_task: StdMutex<Option<AbortHandle>>,
    serve_error_rx: StdMutex<Option<oneshot::Receiver<PeerError>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> StoreResult<Self> {
        let store = Arc::new(ObjectStore::open(&config.store_path)?);
        let index = Arc::new(load_index(&store)?);
        let nonce = rand::thread_rng().gen::<u64>();
        let handle = NodeHandle {
            store,
            index,
            pool: Arc::new(RwLock::new(HashMap::new())),
            pow_target: config.pow_target,
        };
        Ok(Node {
            config,
            nonce,
            handle,
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_task: StdMutex::new(None),
            serve_error_rx: StdMutex::new(None),
        })
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub async fn peer_nonces(&self) -> Vec<u64> {
        self.handle.peer_nonces().await
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Binds the listener, then spawns the accept loop and the GC loop as
    /// background tasks and returns the address actually bound (useful when
    /// `listen_addr`'s port is 0). Per spec, an `accept` error is fatal to
    /// the serve loop; it is not returned from here (the loop starts after
    /// this call returns) but surfaces through `serve_result`, which the
    /// caller awaits alongside its own shutdown signal.
    pub async fn start(&self) -> PeerResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound_addr = listener.local_addr()?;
        log::info!("listening on {}", bound_addr);

        let (error_tx, error_rx) = oneshot::channel();

        let accept_handle = self.handle.clone();
        let accept_node_nonce = self.nonce;
        let accept_our_version = self.config.clone();
        let shutdown = self.shutdown.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let handle = accept_handle.clone();
                        let our_version = build_version(&accept_our_version, accept_node_nonce, remote_addr);
                        tokio::spawn(async move {
                            if let Err(err) = run_connection(stream, remote_addr, false, our_version, handle).await {
                                log::warn!("connection from {} ended: {}", remote_addr, err);
                            }
                        });
                    }
                    Err(err) => {
                        log::warn!("accept error, serve loop terminating: {}", err);
                        let _ = error_tx.send(PeerError::Io(err));
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(accept_task.abort_handle());
        *self.serve_error_rx.lock().unwrap() = Some(error_rx);

        tokio::spawn(run_gc(self.handle.store.clone(), self.handle.index.clone()));
        Ok(bound_addr)
    }

    /// Resolves once the accept loop stops: with the fatal `accept` error if
    /// one occurred, or `Ok(())` if it stopped because of `shutdown` (the
    /// sender is simply dropped in that case, never having sent an error).
    pub async fn serve_result(&self) -> PeerResult<()> {
        let rx = self.serve_error_rx.lock().unwrap().take();
        match rx {
            Some(rx) => match rx.await {
                Ok(err) => Err(err),
                Err(_) => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Dials `peer_addr` and runs the connection as the initiating role.
    pub async fn connect(&self, peer_addr: SocketAddr) -> PeerResult<()> {
        let stream = TcpStream::connect(peer_addr).await?;
        let our_version = build_version(&self.config, self.nonce, peer_addr);
        run_connection(stream, peer_addr, true, our_version, self.handle.clone()).await
    }

    /// Closes the listener and every live connection. The `shutdown` flag
    /// only guards the window between `accept` calls, so the accept task
    /// and each connection's reader/writer tasks are aborted directly
    /// rather than relied on to notice the flag on their own.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(accept_task) = self.accept_task.lock().unwrap().take() {
            accept_task.abort();
        }

        let mut peers = self.handle.pool.write().await;
        for (_, peer) in peers.drain() {
            peer.reader_abort.abort();
            peer.writer_abort.abort();
        }
    }
}

fn build_version(config: &NodeConfig, nonce: u64, remote_addr: SocketAddr) -> VersionMessage {
    use crate::wire_protocol::{Address, SERVICE_NODE_NETWORK};
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let unspecified = Address { services: SERVICE_NODE_NETWORK, ip: [0u8; 16], port: config.listen_addr.port() };
    let remote_echo = match remote_addr {
        SocketAddr::V4(v4) => Address { services: SERVICE_NODE_NETWORK, ip: v4.ip().to_ipv6_mapped().octets(), port: v4.port() },
        SocketAddr::V6(v6) => Address { services: SERVICE_NODE_NETWORK, ip: v6.ip().octets(), port: v6.port() },
    };
    VersionMessage {
        version: 3,
        services: SERVICE_NODE_NETWORK,
        timestamp,
        addr_recv: remote_echo,
        addr_from: unspecified,
        nonce,
        user_agent: config.user_agent.clone(),
        stream_numbers: vec![1],
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a bare `NodeHandle` around a caller-supplied store and index,
    /// bypassing `Node::new`, for dispatch-level unit tests.
    pub fn handle_for_test(store: ObjectStore, index: DashSet<InventoryVector>, pow_target: u64) -> NodeHandle {
        NodeHandle {
            store: Arc::new(store),
            index: Arc::new(index),
            pool: Arc::new(RwLock::new(HashMap::new())),
            pow_target,
        }
    }
}
