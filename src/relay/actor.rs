use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::RoomConfig;

use super::room::{Room, RoomLink};
use super::transport::PendingRequest;
use super::types::{RelayError, RoomId, RoomPhase, RoomSnapshot};

/// Commands sent to the room registry actor
pub(crate) enum RegistryCommand<R> {
    Route {
        room_id: RoomId,
        request: R,
    },
    Evict {
        room_id: RoomId,
        instance: u64,
    },
    Contains {
        room_id: RoomId,
        reply: oneshot::Sender<bool>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<RoomSnapshot>>,
    },
}

struct RoomEntry<R> {
    /// Distinguishes successive rooms under the same id
    instance: u64,
    requests: mpsc::UnboundedSender<R>,
    phase: watch::Receiver<RoomPhase>,
}

fn spawn_room<R: PendingRequest>(
    room_id: RoomId,
    instance: u64,
    config: RoomConfig,
    registry: mpsc::WeakUnboundedSender<RegistryCommand<R>>,
) -> RoomEntry<R> {
    let on_close = Box::new(move || {
        if let Some(tx) = registry.upgrade() {
            let _ = tx.send(RegistryCommand::Evict { room_id, instance });
        }
    });

    let (room, RoomLink { requests, phase }) = Room::new(room_id, config, on_close);
    tokio::spawn(room.run());

    RoomEntry {
        instance,
        requests,
        phase,
    }
}

pub(crate) async fn room_registry_actor<R: PendingRequest>(
    config: RoomConfig,
    registry: mpsc::WeakUnboundedSender<RegistryCommand<R>>,
    mut rx: mpsc::UnboundedReceiver<RegistryCommand<R>>,
) {
    let mut rooms: HashMap<RoomId, RoomEntry<R>> = HashMap::new();
    let mut next_instance: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCommand::Route { room_id, request } => {
                let request = match rooms.get(&room_id) {
                    Some(entry) => match entry.requests.send(request) {
                        Ok(()) => {
                            debug!("Request routed to existing room {}", room_id);
                            continue;
                        }
                        // The room closed but its eviction is still queued behind us.
                        Err(mpsc::error::SendError(request)) => {
                            debug!("Room {} is closing, replacing it", room_id);
                            request
                        }
                    },
                    None => request,
                };

                next_instance += 1;
                let entry = spawn_room(room_id, next_instance, config, registry.clone());
                // A freshly spawned room still holds its receiver.
                let _ = entry.requests.send(request);
                rooms.insert(room_id, entry);

                info!("Room created: {}", room_id);
            }

            RegistryCommand::Evict { room_id, instance } => {
                if rooms
                    .get(&room_id)
                    .is_some_and(|entry| entry.instance == instance)
                {
                    rooms.remove(&room_id);
                    info!("Room {} removed (closed)", room_id);
                }
            }

            RegistryCommand::Contains { room_id, reply } => {
                let _ = reply.send(rooms.contains_key(&room_id));
            }

            RegistryCommand::Count { reply } => {
                let _ = reply.send(rooms.len());
            }

            RegistryCommand::Snapshot { reply } => {
                let snapshot = rooms
                    .iter()
                    .map(|(id, entry)| RoomSnapshot {
                        id: *id,
                        phase: *entry.phase.borrow(),
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// Handle to communicate with the room registry actor
pub struct RoomRegistryHandle<R> {
    pub(crate) tx: mpsc::UnboundedSender<RegistryCommand<R>>,
}

impl<R> Clone for RoomRegistryHandle<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: PendingRequest> RoomRegistryHandle<R> {
    /// Start the registry actor. Must be called inside a tokio runtime.
    pub fn spawn(config: RoomConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(room_registry_actor(config, tx.downgrade(), rx));
        Self { tx }
    }

    /// Hand a validated request to the room for `room_id`, creating the
    /// room if none is live.
    pub fn route(&self, room_id: RoomId, request: R) -> Result<(), RelayError> {
        self.tx
            .send(RegistryCommand::Route { room_id, request })
            .map_err(|_| RelayError::Internal("registry channel closed".to_string()))
    }

    /// Whether a live room exists for `room_id`
    pub async fn contains(&self, room_id: RoomId) -> Result<bool, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RegistryCommand::Contains {
            room_id,
            reply: reply_tx,
        });
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("registry channel closed".to_string()))
    }

    /// Number of live rooms
    pub async fn room_count(&self) -> Result<usize, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RegistryCommand::Count { reply: reply_tx });
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("registry channel closed".to_string()))
    }

    pub async fn snapshot(&self) -> Result<Vec<RoomSnapshot>, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RegistryCommand::Snapshot { reply: reply_tx });
        reply_rx
            .await
            .map_err(|_| RelayError::Internal("registry channel closed".to_string()))
    }
}
