//! Real-time synchronization of a shared document with a remote peer.
//!
//! The worker thread owns its own automerge document and the socket. The
//! main thread talks to it over channels: `SyncCommand` in, `SyncEvent`
//! out. Remote documents come back whole; `Connection::pump` merges them
//! into the local root and re-applies the changed keys through the
//! document's normal remote path, so undo history and shared state never
//! diverge. Connectivity failures surface only as `Disconnected` events -
//! local editing keeps working against local state.

pub mod protocol;

use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use automerge::Automerge;
use tracing::{debug, info, warn};

use crate::awareness::{Awareness, ClientId, CursorState, PresenceBackend, PresenceMessage, UserState};
use crate::crdt::AutomergeRoot;
use crate::diagram::Diagram;
use protocol::{read_frame, write_frame, SyncSession, WireMessage};

/// Events from the sync worker to the main thread
#[derive(Debug)]
pub enum SyncEvent {
    /// Connection established and initial state offered to the peer.
    Connected,
    /// Connection closed; the worker is done.
    Disconnected,
    /// Remote changes received, merged into the worker's document.
    RemoteDocument(Automerge),
    /// Presence update from the remote peer.
    Presence(PresenceMessage),
    /// Error occurred
    Error(String),
}

/// Commands from the main thread to the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Send local document state
    PublishDocument(Automerge),
    /// Forward a presence message to the peer
    PublishPresence(PresenceMessage),
    /// Shutdown sync
    Shutdown,
}

/// Handle for one peer connection, owned by the main thread.
pub struct Connection {
    command_tx: mpsc::Sender<SyncCommand>,
    event_rx: mpsc::Receiver<SyncEvent>,
    thread: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect to a peer and seed the worker with the root's current state.
    pub fn connect(url: &str, root: &AutomergeRoot) -> Result<Self> {
        let stream = TcpStream::connect(url)?;
        info!(%url, "connected to collaboration peer");
        Self::over_stream(stream, root.fork())
    }

    /// Run the sync worker over an established stream (accepted sockets,
    /// tests).
    pub fn over_stream(stream: TcpStream, seed: Automerge) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            if let Err(e) = run_connection(stream, seed, &event_tx, command_rx) {
                let _ = event_tx.send(SyncEvent::Error(e.to_string()));
            }
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        Ok(Self {
            command_tx,
            event_rx,
            thread: Some(thread),
        })
    }

    /// Non-blocking check for sync events
    pub fn poll_event(&self) -> Option<SyncEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Send a command to the sync worker
    pub fn send_command(&self, cmd: SyncCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|_| anyhow!("sync worker is gone"))
    }

    /// Push the current local document state to the peer.
    pub fn publish_document(&self, root: &AutomergeRoot) -> Result<()> {
        self.send_command(SyncCommand::PublishDocument(root.fork()))
    }

    /// Presence channel handle for `Awareness::set_backend`.
    pub fn presence_backend(&self, client: ClientId) -> Box<dyn PresenceBackend> {
        Box::new(ConnectionPresence {
            client,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Drain pending events: merge remote documents into the root and
    /// re-apply the changed keys through the document's remote path, route
    /// presence to awareness.
    pub fn pump(
        &self,
        diagram: &mut Diagram,
        root: &AutomergeRoot,
        awareness: &mut Awareness,
    ) -> Result<()> {
        while let Some(event) = self.poll_event() {
            match event {
                SyncEvent::RemoteDocument(mut doc) => {
                    let changes = root.merge_remote(&mut doc)?;
                    if !changes.is_empty() {
                        diagram.apply_remote_changes(&changes)?;
                    }
                }
                SyncEvent::Presence(msg) => awareness.apply_remote(msg),
                SyncEvent::Connected => debug!("sync connection established"),
                SyncEvent::Disconnected => {
                    awareness.set_backend(None)?;
                    debug!("sync connection lost");
                }
                SyncEvent::Error(e) => warn!(error = %e, "sync error"),
            }
        }
        Ok(())
    }

    /// Graceful shutdown; blocks until the worker exits.
    pub fn disconnect(mut self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown);
    }
}

/// Presence backend publishing through the connection's command channel.
struct ConnectionPresence {
    client: ClientId,
    command_tx: mpsc::Sender<SyncCommand>,
}

impl PresenceBackend for ConnectionPresence {
    fn publish_user(&self, client: ClientId, state: &UserState) -> Result<()> {
        self.command_tx
            .send(SyncCommand::PublishPresence(PresenceMessage::User {
                client,
                state: state.clone(),
            }))
            .map_err(|_| anyhow!("sync worker is gone"))
    }

    fn publish_cursor(&self, client: ClientId, state: &CursorState) -> Result<()> {
        self.command_tx
            .send(SyncCommand::PublishPresence(PresenceMessage::Cursor {
                client,
                state: state.clone(),
            }))
            .map_err(|_| anyhow!("sync worker is gone"))
    }

    fn close(&self) {
        let _ = self
            .command_tx
            .send(SyncCommand::PublishPresence(PresenceMessage::Leave {
                client: self.client,
            }));
    }
}

enum Inbound {
    Frame(WireMessage),
    Closed,
}

/// Main worker loop: frames in from the reader thread, commands in from the
/// main thread, sync responses and presence out on the socket.
fn run_connection(
    stream: TcpStream,
    seed: Automerge,
    events: &mpsc::Sender<SyncEvent>,
    commands: mpsc::Receiver<SyncCommand>,
) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let (inbound_tx, inbound_rx) = mpsc::channel();

    let reader_thread = thread::spawn(move || {
        let mut reader = stream;
        loop {
            match read_frame(&mut reader) {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    match WireMessage::decode(&bytes) {
                        Ok(msg) => {
                            if inbound_tx.send(Inbound::Frame(msg)).is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            let _ = inbound_tx.send(Inbound::Closed);
                            break;
                        }
                    }
                }
                Err(_) => {
                    let _ = inbound_tx.send(Inbound::Closed);
                    break;
                }
            }
        }
    });

    let outcome = connection_loop(&mut writer, seed, events, &commands, &inbound_rx);

    // Unblock the reader so it can exit, even on a protocol error.
    let _ = writer.shutdown(std::net::Shutdown::Both);
    let _ = reader_thread.join();
    outcome
}

fn connection_loop(
    writer: &mut TcpStream,
    seed: Automerge,
    events: &mpsc::Sender<SyncEvent>,
    commands: &mpsc::Receiver<SyncCommand>,
    inbound_rx: &mpsc::Receiver<Inbound>,
) -> Result<()> {
    let mut doc = seed;
    let mut session = SyncSession::new();

    // Offer our state and ask for presence right away.
    send_sync_messages(writer, &mut session, &doc)?;
    write_message(writer, &WireMessage::Presence(PresenceMessage::RequestAll))?;
    let _ = events.send(SyncEvent::Connected);

    'outer: loop {
        match inbound_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(Inbound::Frame(WireMessage::Sync(bytes))) => {
                session.receive_message(&mut doc, &bytes)?;
                send_sync_messages(writer, &mut session, &doc)?;
                let _ = events.send(SyncEvent::RemoteDocument(doc.clone()));
            }
            Ok(Inbound::Frame(WireMessage::Presence(msg))) => {
                let _ = events.send(SyncEvent::Presence(msg));
            }
            Ok(Inbound::Closed) => break 'outer,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break 'outer,
        }

        loop {
            match commands.try_recv() {
                Ok(SyncCommand::PublishDocument(mut other)) => {
                    doc.merge(&mut other)?;
                    send_sync_messages(writer, &mut session, &doc)?;
                }
                Ok(SyncCommand::PublishPresence(msg)) => {
                    write_message(writer, &WireMessage::Presence(msg))?;
                }
                Ok(SyncCommand::Shutdown) => break 'outer,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => break 'outer,
            }
        }
    }

    Ok(())
}

fn write_message(writer: &mut TcpStream, msg: &WireMessage) -> Result<()> {
    write_frame(writer, &msg.encode()?)?;
    Ok(())
}

fn send_sync_messages(
    writer: &mut TcpStream,
    session: &mut SyncSession,
    doc: &Automerge,
) -> Result<()> {
    for bytes in session.generate_messages(doc) {
        write_message(writer, &WireMessage::Sync(bytes))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::CollabConfig;
    use crate::element::Element;
    use crate::layer::Layer;
    use std::net::TcpListener;
    use std::rc::Rc;

    struct Peer {
        diagram: Diagram,
        root: Rc<AutomergeRoot>,
        awareness: Awareness,
        connection: Connection,
    }

    fn peer_pair() -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let make = |stream: TcpStream| {
            let root = AutomergeRoot::shared();
            let diagram = Diagram::new(CollabConfig::with_root(root.clone())).unwrap();
            let connection = Connection::over_stream(stream, root.fork()).unwrap();
            Peer {
                diagram,
                root,
                awareness: Awareness::new(),
                connection,
            }
        };
        (make(client), make(server))
    }

    fn pump_until(peers: &mut [&mut Peer], mut done: impl FnMut(&Peer) -> bool) {
        for _ in 0..400 {
            for peer in peers.iter_mut() {
                peer.connection
                    .pump(&mut peer.diagram, &peer.root, &mut peer.awareness)
                    .unwrap();
            }
            if peers.iter().all(|p| done(&**p)) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("peers did not converge in time");
    }

    #[test]
    fn edits_replicate_between_two_connected_peers() {
        let (mut a, mut b) = peer_pair();

        let mut uow = a.diagram.begin(false);
        let layer = a
            .diagram
            .add_layer(Layer::new("Layer 1"), &mut uow)
            .unwrap();
        let id = a
            .diagram
            .add_element(layer, Element::node("node"), &mut uow)
            .unwrap();
        uow.commit(&mut a.diagram).unwrap();
        a.connection.publish_document(&a.root).unwrap();

        pump_until(&mut [&mut a, &mut b], |p| p.diagram.element(id).is_some());

        assert_eq!(
            a.diagram.export_state().unwrap(),
            b.diagram.export_state().unwrap()
        );

        a.connection.disconnect();
        b.connection.disconnect();
    }

    #[test]
    fn presence_flows_between_peers() {
        let (mut a, mut b) = peer_pair();

        let client_a = a.awareness.client_id();
        let backend = a.connection.presence_backend(client_a);
        a.awareness.set_backend(Some(backend)).unwrap();
        a.awareness
            .update_user(UserState::new("ada", client_a.color_index()))
            .unwrap();

        pump_until(&mut [&mut a, &mut b], |p| {
            p.awareness.client_id() == client_a || !p.awareness.user_states().is_empty()
        });

        let users = b.awareness.user_states();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].1.name, "ada");

        a.connection.disconnect();
        b.connection.disconnect();
    }
}
