//! End-to-end tests for the relay.
//!
//! Each test binds a real relay on a free port and talks to it over raw
//! WebSockets, driving the handshake with a `SyncSession`.

use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use aegis_core::{Collection, RecordCollections, RecordFields, SharedDoc, YrsReplica};
use aegis_sync::protocol::Message;
use aegis_sync::server::{ServerConfig, SyncServer, LIVENESS_BODY};
use aegis_sync::session::SyncSession;
use tempfile::TempDir;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on a free port, return its address.
async fn start_relay() -> (String, Arc<SyncServer<YrsReplica>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (addr, server)
}

/// A persistent relay on its own runtime, so stopping it releases the
/// database before the next instance opens the same directory.
struct DurableRelay {
    addr: String,
    stop: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl DurableRelay {
    fn start(dir: &Path) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = ServerConfig {
            storage_path: Some(dir.to_path_buf()),
            ..ServerConfig::for_testing()
        };

        let (stop, stopped) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let server = SyncServer::<YrsReplica>::new(config).unwrap();
                server.recover().await.unwrap();
                let listener = TcpListener::from_std(listener).unwrap();
                server
                    .serve_with_shutdown(listener, async {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            });
        });
        Self { addr, stop, thread }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        tokio::task::spawn_blocking(move || self.thread.join().unwrap())
            .await
            .unwrap();
    }
}

fn patient(name: &str) -> RecordFields {
    let mut fields = RecordFields::new();
    fields.insert("firstName".into(), name.into());
    fields
}

fn doc(client_id: u64) -> SharedDoc<YrsReplica> {
    SharedDoc::new(YrsReplica::with_client_id(client_id))
}

/// A hand-driven peer: raw socket plus a sync session.
struct Peer {
    ws: Ws,
    session: SyncSession<YrsReplica>,
    doc: SharedDoc<YrsReplica>,
}

impl Peer {
    /// Connect to `room` and complete the handshake.
    async fn join(addr: &str, room: &str, doc: SharedDoc<YrsReplica>) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/{room}")).await.unwrap();
        let mut peer = Self {
            ws,
            session: SyncSession::new(doc.clone(), format!("peer/{room}")),
            doc,
        };

        let step1 = peer.session.open();
        peer.send(step1).await;
        while !peer.session.is_synced() {
            let frame = peer.recv().await.expect("relay closed during handshake");
            peer.handle(&frame).await;
        }
        peer
    }

    async fn send(&mut self, frame: Vec<u8>) {
        self.ws.send(WsMessage::Binary(frame.into())).await.unwrap();
    }

    /// Next binary frame, or None once the relay closed the connection.
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let next = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("no frame within timeout");
            match next {
                Some(Ok(WsMessage::Binary(data))) => return Some(data.to_vec()),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// True if no binary frame arrives within `wait`.
    async fn stays_quiet(&mut self, wait: Duration) -> bool {
        loop {
            match timeout(wait, self.ws.next()).await {
                Err(_) => return true,
                Ok(Some(Ok(WsMessage::Binary(_)))) => return false,
                Ok(Some(Ok(_))) => {}
                Ok(_) => return true,
            }
        }
    }

    async fn handle(&mut self, frame: &[u8]) {
        let output = self.session.on_frame(frame).unwrap();
        for reply in output.replies {
            self.send(reply).await;
        }
    }

    /// Make a local edit and push it to the relay. Returns the UPDATE frame.
    async fn put(&mut self, id: &str, name: &str) -> Vec<u8> {
        let update = self
            .doc
            .with(|d| d.put_record(Collection::Patients, id, &patient(name)))
            .unwrap();
        let frame = Message::update(update).encode();
        self.send(frame.clone()).await;
        frame
    }

    fn has_patient(&self, id: &str) -> bool {
        self.doc
            .with(|d| d.get_record(Collection::Patients, id))
            .is_some()
    }
}

#[tokio::test]
async fn test_handshake_joins_default_room() {
    let (addr, server) = start_relay().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let mut session = SyncSession::new(doc(1), "raw");
    ws.send(WsMessage::Binary(session.open().into())).await.unwrap();

    while !session.is_synced() {
        let Some(Ok(WsMessage::Binary(frame))) = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
        else {
            panic!("expected a binary frame");
        };
        for reply in session.on_frame(&frame).unwrap().replies {
            ws.send(WsMessage::Binary(reply.into())).await.unwrap();
        }
    }

    assert_eq!(server.rooms().member_count("aegis-health").await, 1);
    assert!(server.documents().contains("aegis-health").await);
}

#[tokio::test]
async fn test_update_reaches_peers_but_not_sender() {
    let (addr, _server) = start_relay().await;
    let mut alice = Peer::join(&addr, "clinic", doc(1)).await;
    let mut bob = Peer::join(&addr, "clinic", doc(2)).await;

    let sent = alice.put("p1", "Maria").await;

    let received = bob.recv().await.unwrap();
    assert_eq!(received, sent, "relay forwards the original frame bytes");
    bob.handle(&received).await;
    assert!(bob.has_patient("p1"));

    assert!(alice.stays_quiet(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (addr, server) = start_relay().await;
    let mut alice = Peer::join(&addr, "clinic-a", doc(1)).await;
    let mut bob = Peer::join(&addr, "clinic-a", doc(2)).await;
    let mut carol = Peer::join(&addr, "clinic-b", doc(3)).await;

    alice.put("p1", "Only in A").await;
    assert!(bob.recv().await.is_some());
    assert!(carol.stays_quiet(Duration::from_millis(200)).await);

    assert_eq!(server.rooms().room_count().await, 2);
    assert_eq!(server.documents().len().await, 2);
}

#[tokio::test]
async fn test_late_joiner_receives_existing_state() {
    let (addr, _server) = start_relay().await;
    let mut alice = Peer::join(&addr, "clinic", doc(1)).await;
    let mut bob = Peer::join(&addr, "clinic", doc(2)).await;

    alice.put("p1", "Maria").await;
    alice.put("p2", "Nikos").await;
    // Once Bob saw both, the relay document holds them.
    bob.recv().await.unwrap();
    bob.recv().await.unwrap();

    let dave = Peer::join(&addr, "clinic", doc(4)).await;
    assert!(dave.has_patient("p1"));
    assert!(dave.has_patient("p2"));
}

#[tokio::test]
async fn test_offline_content_in_step2_is_relayed() {
    let (addr, _server) = start_relay().await;
    let mut bob = Peer::join(&addr, "clinic", doc(2)).await;

    let offline = doc(7);
    offline
        .with(|d| d.put_record(Collection::Patients, "p-offline", &patient("Written offline")))
        .unwrap();
    let _carol = Peer::join(&addr, "clinic", offline).await;

    let frame = bob.recv().await.unwrap();
    bob.handle(&frame).await;
    assert!(bob.has_patient("p-offline"));
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let (addr, server) = start_relay().await;
    let mut mallory = Peer::join(&addr, "clinic", doc(1)).await;
    let mut bob = Peer::join(&addr, "clinic", doc(2)).await;
    let mut carol = Peer::join(&addr, "clinic", doc(3)).await;

    mallory.send(vec![7, 0, 0]).await;
    assert!(mallory.recv().await.is_none(), "relay closes the offender");

    let sent = carol.put("p1", "Still working").await;
    assert_eq!(bob.recv().await.unwrap(), sent);

    let stats = server.stats().await;
    assert_eq!(stats.rejected_frames, 1);
}

#[tokio::test]
async fn test_plain_http_get_is_liveness_check() {
    let (addr, server) = start_relay().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with(LIVENESS_BODY));
    assert_eq!(server.stats().await.http_requests, 1);
    assert_eq!(server.documents().len().await, 0);
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let (addr, server) = start_relay().await;
    let alice = Peer::join(&addr, "clinic", doc(1)).await;
    assert_eq!(server.rooms().member_count("clinic").await, 1);

    drop(alice);
    for _ in 0..100 {
        if server.rooms().member_count("clinic").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.rooms().member_count("clinic").await, 0);
    // The document outlives its last member.
    assert!(server.documents().contains("clinic").await);
}

#[tokio::test]
async fn test_restarted_relay_serves_persisted_records() {
    let dir = TempDir::new().unwrap();

    let relay = DurableRelay::start(dir.path());
    let mut alice = Peer::join(&relay.addr, "clinic", doc(1)).await;
    let mut bob = Peer::join(&relay.addr, "clinic", doc(2)).await;
    alice.put("p1", "Maria").await;
    // Bob seeing the update means the relay applied and queued it.
    bob.recv().await.unwrap();
    alice.ws.close(None).await.unwrap();
    bob.ws.close(None).await.unwrap();
    relay.stop().await;

    let relay = DurableRelay::start(dir.path());
    let carol = Peer::join(&relay.addr, "clinic", doc(3)).await;
    assert!(carol.has_patient("p1"));
    let record = carol
        .doc
        .with(|d| d.get_record(Collection::Patients, "p1"))
        .unwrap();
    assert_eq!(record["firstName"], "Maria");
    drop(carol);
    relay.stop().await;
}
