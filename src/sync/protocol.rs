//! Wire protocol for document synchronization.
//!
//! Uses persistent bidirectional connections carrying length-prefixed
//! frames. Each frame is one `WireMessage`: either an automerge sync
//! message or a presence update, multiplexed on the same stream. The
//! incremental sync exchange itself is automerge's sync protocol, driven
//! through `SyncSession`.

use std::io::{Read, Write};

use anyhow::Result;
use automerge::sync::{Message, State as SyncState, SyncDoc};
use automerge::Automerge;
use serde::{Deserialize, Serialize};

use crate::awareness::PresenceMessage;

/// Upper bound on a single frame; counters corrupt length prefixes.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// One multiplexed message on the sync stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Encoded automerge sync message.
    Sync(Vec<u8>),
    Presence(PresenceMessage),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Send a frame with length prefix
pub fn write_frame<W: Write>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u64;
    writer.write_all(&len.to_le_bytes())?;
    if !data.is_empty() {
        writer.write_all(data)?;
    }
    writer.flush()?;
    Ok(())
}

/// Receive a frame with length prefix
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::other(format!("frame too large: {len}")));
    }

    if len == 0 {
        return Ok(Vec::new());
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Incremental sync exchange with one peer.
///
/// Per-peer state for automerge's sync protocol: `generate_messages` drains
/// everything the peer does not have yet, `receive_message` applies a
/// message from the peer to the local document.
pub struct SyncSession {
    state: SyncState,
}

impl SyncSession {
    pub fn new() -> Self {
        Self {
            state: SyncState::new(),
        }
    }

    /// Messages to send to the peer now, until automerge has nothing more.
    pub fn generate_messages(&mut self, doc: &Automerge) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        while let Some(msg) = doc.generate_sync_message(&mut self.state) {
            messages.push(msg.encode());
        }
        messages
    }

    /// Apply one sync message from the peer.
    pub fn receive_message(&mut self, doc: &mut Automerge, bytes: &[u8]) -> Result<()> {
        let message = Message::decode(bytes)?;
        doc.receive_sync_message(&mut self.state, message)?;
        Ok(())
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}
