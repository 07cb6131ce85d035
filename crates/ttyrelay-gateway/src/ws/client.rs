//! The single byte-stream client slot of a session port.
//!
//! A slot is reserved during the HTTP handshake, before the upgrade, so a
//! second client is refused with 409 instead of being upgraded and dropped.
//! The reservation releases itself when dropped, including when the upgrade
//! never completes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

struct Attached {
    conn_id: String,
    /// `None` between the handshake and the upgrade.
    output: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
pub struct ClientSlot {
    inner: Mutex<Option<Attached>>,
}

impl std::fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl ClientSlot {
    /// Claim the slot for a new connection, or `None` when it is taken.
    pub fn try_reserve(self: &Arc<Self>) -> Option<Reservation> {
        let mut inner = self.lock();
        if inner.is_some() {
            return None;
        }
        let conn_id = uuid::Uuid::new_v4().to_string();
        *inner = Some(Attached {
            conn_id: conn_id.clone(),
            output: None,
        });
        Some(Reservation {
            slot: Arc::clone(self),
            conn_id,
        })
    }

    /// Hand a PTY output chunk to the attached client.
    ///
    /// Returns `false` when nobody is listening; the chunk is dropped.
    pub fn forward(&self, chunk: Vec<u8>) -> bool {
        match self.lock().as_ref().and_then(|a| a.output.as_ref()) {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Attached>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of ownership of a [`ClientSlot`].
#[derive(Debug)]
pub struct Reservation {
    slot: Arc<ClientSlot>,
    conn_id: String,
}

impl Reservation {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Start receiving output once the socket is live.
    pub fn attach(&self, output: mpsc::UnboundedSender<Vec<u8>>) {
        if let Some(a) = self.slot.lock().as_mut() {
            if a.conn_id == self.conn_id {
                a.output = Some(output);
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut inner = self.slot.lock();
        if inner.as_ref().is_some_and(|a| a.conn_id == self.conn_id) {
            *inner = None;
        }
    }
}
