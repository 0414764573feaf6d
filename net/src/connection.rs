//! The steady-state relay loop: two cooperating tasks per connection,
//! generalized from `bitmagier-p2p-bitcoin-handshake`'s single-future
//! `proceed_conversation` (which only ever needs to drive one short-lived
//! exchange) into the always-on reader/writer split spec.md §4.5 requires.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use crate::error::{PeerError, PeerResult};
use crate::handshake::{run_handshake, Handshake};
use crate::node::NodeHandle;
use crate::pow;
use crate::wire_protocol::{
    Frame, GetDataMessage, InvMessage, InventoryVector, MessageCodec, ObjectMessage, ProtocolMessage, VersionMessage,
};

const STEADY_STATE_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const QUEUE_CAPACITY: usize = 5;

/// An object expiring at or before `now - TTL_GRACE` is rejected rather
/// than stored; zero means no slack past the wire deadline.
const TTL_GRACE: i64 = 0;

/// Runs one peer connection end to end: handshake, pool registration,
/// steady-state relay, and pool deregistration on exit. Returns once the
/// connection has fully shut down.
pub async fn run_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    initiator: bool,
    our_version: VersionMessage,
    node: NodeHandle,
) -> PeerResult<()> {
    let mut framed = Framed::new(stream, MessageCodec::new());

    let handshake = if initiator { Handshake::initiator(our_version) } else { Handshake::responder(our_version) };
    let remote_version = run_handshake(&mut framed, handshake).await?;
    let peer_nonce = remote_version.nonce;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ProtocolMessage>(QUEUE_CAPACITY);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<ProtocolMessage>(QUEUE_CAPACITY);

    let initial_inventory = node.store_snapshot();
    if !initial_inventory.is_empty() {
        let _ = outbound_tx.send(ProtocolMessage::Inv(InvMessage { vectors: initial_inventory })).await;
    }

    let (mut sink, mut source) = framed.split();

    let reader_remote = remote_addr;
    let reader = tokio::spawn(async move {
        loop {
            let next = timeout(STEADY_STATE_IDLE_TIMEOUT, source.next()).await;
            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => {
                    log::warn!("read error from {}: {}", reader_remote, err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    log::debug!("idle timeout on connection to {}", reader_remote);
                    break;
                }
            };
            match frame {
                Frame::Message(message) => {
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Frame::Raw(raw) => {
                    log::debug!("dropping unrecognized {} message from {}", raw.command_type, reader_remote);
                }
            }
        }
    });

    let dispatch_node = node.clone();
    let dispatch_tx = outbound_tx.clone();
    let writer_remote = remote_addr;
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                incoming = inbound_rx.recv() => {
                    match incoming {
                        Some(message) => {
                            if let Err(err) = dispatch(message, peer_nonce, &dispatch_node, &dispatch_tx).await {
                                log::warn!("protocol violation from {}: {}", writer_remote, err);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            if let Err(err) = sink.send(message).await {
                                log::warn!("write error to {}: {}", writer_remote, err);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Registered only now that both task handles exist, so `Node::shutdown`
    // always has an abort handle to reach for this peer.
    node.register_peer(peer_nonce, remote_addr, outbound_tx.clone(), reader.abort_handle(), writer.abort_handle())
        .await;

    let _ = tokio::join!(reader, writer);
    node.deregister_peer(peer_nonce).await;
    Ok(())
}

async fn dispatch(
    message: ProtocolMessage,
    peer_nonce: u64,
    node: &NodeHandle,
    outbound_tx: &mpsc::Sender<ProtocolMessage>,
) -> PeerResult<()> {
    let command = message.command();
    match message {
        ProtocolMessage::Addr(addr) => {
            node.emit_addr_gossip(addr);
            Ok(())
        }
        ProtocolMessage::Inv(inv) => {
            let mut missing = node.missing_vectors(&inv.vectors);
            if !missing.is_empty() {
                missing.sort();
                // try_send, not send: this task is also outbound_rx's only
                // drainer, so blocking here on a full queue would deadlock it
                // against itself. A dropped getdata is recovered on the next inv.
                if let Err(err) = outbound_tx.try_send(ProtocolMessage::GetData(GetDataMessage { vectors: missing })) {
                    log::debug!("outbound queue full, dropping getdata to peer {}: {}", peer_nonce, err);
                }
            }
            Ok(())
        }
        ProtocolMessage::GetData(getdata) => {
            for vector in getdata.vectors {
                if let Some(body) = node.get_object(&vector)? {
                    if let Ok(object) = ObjectMessage::decode_payload(&body) {
                        // Same self-deadlock hazard as above: stop at the first
                        // full queue instead of blocking on our own drain task.
                        if let Err(err) = outbound_tx.try_send(ProtocolMessage::Object(object)) {
                            log::debug!("outbound queue full, dropping getdata reply to peer {}: {}", peer_nonce, err);
                            break;
                        }
                    }
                }
            }
            Ok(())
        }
        ProtocolMessage::Object(object) => {
            let body = object.encode_payload();
            let vector = InventoryVector::of_object_body(&body);
            if node.index_contains(&vector) {
                return Ok(());
            }
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
            if object.expiration <= now - TTL_GRACE {
                return Err(PeerError::Violation("object is already expired".to_string()));
            }
            if !pow::check_pow(&body, node.pow_target()) {
                return Err(PeerError::Violation("object fails proof-of-work target".to_string()));
            }
            node.store_object(vector, body)?;
            node.broadcast_inv(vector, peer_nonce).await;
            Ok(())
        }
        ProtocolMessage::Version(_) | ProtocolMessage::Verack => {
            Err(PeerError::Violation(format!("{} received after handshake", command)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire_protocol::{Address, SERVICE_NODE_NETWORK};
    use std::time::Duration as StdDuration;

    fn sample_object(nonce_bytes: [u8; 8], expiration: i64, payload: &[u8]) -> ObjectMessage {
        ObjectMessage {
            nonce: nonce_bytes,
            expiration,
            object_type: 1,
            object_version: 1,
            stream: 1,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_failing_pow_is_rejected_without_storing() {
        let dir = std::env::temp_dir().join(format!("net-connection-test-{:?}", std::thread::current().id()));
        let store = crate::store::ObjectStore::open(dir.to_str().unwrap()).unwrap();
        let index = dashmap::DashSet::new();
        let node = crate::node::test_support::handle_for_test(store, index, 0);

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut object = sample_object([0u8; 8], 4_000_000_000, b"hello");
        object.nonce = [0xffu8; 8];
        let err = dispatch(ProtocolMessage::Object(object), 1, &node, &tx).await.unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
        assert!(tokio::time::timeout(StdDuration::from_millis(10), rx.recv()).await.is_err());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_meeting_pow_is_stored_and_broadcast() {
        let dir = std::env::temp_dir().join(format!("net-connection-test2-{:?}", std::thread::current().id()));
        let store = crate::store::ObjectStore::open(dir.to_str().unwrap()).unwrap();
        let index = dashmap::DashSet::new();
        let node = crate::node::test_support::handle_for_test(store, index, u64::MAX);

        let (tx, _rx) = mpsc::channel(QUEUE_CAPACITY);
        let object = sample_object([0u8; 8], 4_000_000_000, b"hello");
        let vector = InventoryVector::of_object_body(&object.encode_payload());
        dispatch(ProtocolMessage::Object(object), 1, &node, &tx).await.unwrap();
        assert!(node.index_contains(&vector));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn object_already_expired_is_rejected_without_storing() {
        let dir = std::env::temp_dir().join(format!("net-connection-test4-{:?}", std::thread::current().id()));
        let store = crate::store::ObjectStore::open(dir.to_str().unwrap()).unwrap();
        let index = dashmap::DashSet::new();
        let node = crate::node::test_support::handle_for_test(store, index, u64::MAX);

        let (tx, _rx) = mpsc::channel(QUEUE_CAPACITY);
        let object = sample_object([0u8; 8], 1, b"stale");
        let vector = InventoryVector::of_object_body(&object.encode_payload());
        let err = dispatch(ProtocolMessage::Object(object), 1, &node, &tx).await.unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
        assert!(!node.index_contains(&vector));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_outbound_queue_drops_getdata_reply_instead_of_blocking() {
        let dir = std::env::temp_dir().join(format!("net-connection-test5-{:?}", std::thread::current().id()));
        let store = crate::store::ObjectStore::open(dir.to_str().unwrap()).unwrap();
        let index = dashmap::DashSet::new();
        let node = crate::node::test_support::handle_for_test(store, index, u64::MAX);

        // Seed one object so GetData has something to reply with, then fill
        // the outbound queue to capacity before dispatching.
        let object = sample_object([0u8; 8], 4_000_000_000, b"hello");
        let vector = InventoryVector::of_object_body(&object.encode_payload());
        node.store_object(vector, object.encode_payload()).unwrap();

        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        for _ in 0..QUEUE_CAPACITY {
            tx.try_send(ProtocolMessage::Verack).unwrap();
        }

        let getdata = GetDataMessage { vectors: vec![vector] };
        let result = tokio::time::timeout(
            StdDuration::from_millis(200),
            dispatch(ProtocolMessage::GetData(getdata), 1, &node, &tx),
        )
        .await;
        // Must return promptly (not hang forever waiting for a slot it is
        // itself responsible for draining) even though the queue was full.
        assert!(result.is_ok());
        assert!(result.unwrap().is_ok());

        for _ in 0..QUEUE_CAPACITY {
            assert!(matches!(rx.recv().await, Some(ProtocolMessage::Verack)));
        }
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn version_after_handshake_is_a_violation() {
        let dir = std::env::temp_dir().join(format!("net-connection-test3-{:?}", std::thread::current().id()));
        let store = crate::store::ObjectStore::open(dir.to_str().unwrap()).unwrap();
        let index = dashmap::DashSet::new();
        let node = crate::node::test_support::handle_for_test(store, index, 0);
        let (tx, _rx) = mpsc::channel(QUEUE_CAPACITY);

        let version = VersionMessage {
            version: 3,
            services: SERVICE_NODE_NETWORK,
            timestamp: 0,
            addr_recv: Address { services: SERVICE_NODE_NETWORK, ip: [0u8; 16], port: 1 },
            addr_from: Address { services: SERVICE_NODE_NETWORK, ip: [0u8; 16], port: 1 },
            nonce: 1,
            user_agent: String::new(),
            stream_numbers: vec![1],
        };
        let err = dispatch(ProtocolMessage::Version(version), 1, &node, &tx).await.unwrap_err();
        assert!(matches!(err, PeerError::Violation(_)));
    }
}
