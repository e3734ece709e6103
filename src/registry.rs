//! Slots for every connection the receiver has admitted.
//!
//! Removing a client clears its slot to `None` rather than shifting the vector,
//! so slot indices handed to the poller stay valid for the rest of a dispatch
//! pass. `compact` drops the cleared slots and is only called between passes.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} is not registered")]
    UnknownClient(ClientId),
}

#[derive(Debug)]
pub struct ClientSlot {
    pub id: ClientId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Journal key for this connection.
    pub session_id: Uuid,
    pub frames: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientSlot>>,
    next_id: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot for a freshly accepted connection.
    pub fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> (usize, ClientId) {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.slots.push(Some(ClientSlot {
            id,
            stream,
            peer,
            session_id: Uuid::new_v4(),
            frames: 0,
            bytes: 0,
        }));
        (self.slots.len() - 1, id)
    }

    /// Clear the slot holding `id` and hand the connection back to the caller.
    pub fn remove(&mut self, id: ClientId) -> Result<ClientSlot, RegistryError> {
        self.slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|s| s.id == id))
            .and_then(Option::take)
            .ok_or(RegistryError::UnknownClient(id))
    }

    pub fn get(&self, index: usize) -> Option<&ClientSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ClientSlot> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Occupied slots with their indices, in slot order.
    pub fn active(&self) -> impl Iterator<Item = (usize, &ClientSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (i, s)))
    }

    pub fn compact(&mut self) {
        self.slots.retain(Option::is_some);
    }

    /// Slot count including cleared slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Shut down every open connection and release the slot storage.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.slots.drain(..).flatten() {
            let _ = slot.stream.shutdown(Shutdown::Both);
            closed += 1;
        }
        closed
    }
}

impl Drop for ClientRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
