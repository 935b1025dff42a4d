//! In-process locality mesh.
//!
//! Wires `N` runtime-support servers in one process over channels, encoding
//! every parcel through the real wire codec. This is the transport used by
//! single-process multi-locality runs and by the integration suites; a
//! networked deployment replaces it with a socket-backed [`ParcelSender`].
//!
//! Delivery dispatches each incoming action on its own thread, the way the
//! real runtime runs actions on lightweight tasks: stop sequences block
//! their action thread without wedging the inbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::action::{decode_result, encode_result, Action, ActionResult, Parcel};
use crate::server::RuntimeSupport;
use crate::services::{Completion, ParcelSender};
use crate::types::LocalityId;

enum WireMsg {
    /// An encoded parcel plus an optional acknowledgment tag.
    Parcel {
        from: LocalityId,
        seq: Option<u64>,
        bytes: Vec<u8>,
    },
    /// Acknowledgment of a tagged parcel, carrying the encoded result.
    Ack { seq: u64, bytes: Vec<u8> },
    /// Shuts the inbox down.
    Close,
}

struct PendingAck {
    completion: Completion,
    result: Arc<Mutex<Option<ActionResult>>>,
}

/// One locality's endpoint in the in-process mesh.
pub struct MeshNode {
    here: LocalityId,
    me: Weak<MeshNode>,
    peers: Vec<Sender<WireMsg>>,
    receiver: Mutex<Option<Receiver<WireMsg>>>,
    server: OnceLock<Arc<RuntimeSupport>>,
    pending: Mutex<HashMap<u64, PendingAck>>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("here", &self.here)
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// Builds a fully connected mesh of `n` localities.
#[must_use]
pub fn build_mesh(n: u32) -> Vec<Arc<MeshNode>> {
    let mut channels = Vec::with_capacity(n as usize);
    for _ in 0..n {
        channels.push(unbounded::<WireMsg>());
    }
    let senders: Vec<Sender<WireMsg>> = channels.iter().map(|(tx, _)| tx.clone()).collect();

    channels
        .into_iter()
        .enumerate()
        .map(|(i, (_, rx))| {
            Arc::new_cyclic(|me| MeshNode {
                here: LocalityId::from_raw(u32::try_from(i).unwrap_or(u32::MAX)),
                me: me.clone(),
                peers: senders.clone(),
                receiver: Mutex::new(Some(rx)),
                server: OnceLock::new(),
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
            })
        })
        .collect()
}

impl MeshNode {
    /// This endpoint's locality.
    #[must_use]
    pub fn here(&self) -> LocalityId {
        self.here
    }

    /// Binds the server and starts the inbox thread. Call once, before any
    /// traffic flows.
    pub fn attach(&self, server: Arc<RuntimeSupport>) {
        if self.server.set(server).is_err() {
            tracing::error!(here = %self.here, "mesh node attached twice");
            return;
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .expect("inbox receiver already taken");
        let node = self.me.upgrade().expect("mesh node dropped before attach");
        thread::Builder::new()
            .name(format!("mesh-inbox-{}", self.here))
            .spawn(move || node.inbox_loop(&receiver))
            .expect("failed to spawn inbox thread");
    }

    /// Stops the inbox thread; in-flight actions finish on their own
    /// threads.
    pub fn close(&self) {
        let _ = self.peers[self.here.raw() as usize].send(WireMsg::Close);
    }

    fn inbox_loop(&self, receiver: &Receiver<WireMsg>) {
        while let Ok(msg) = receiver.recv() {
            match msg {
                WireMsg::Parcel { from, seq, bytes } => {
                    let parcel = match Parcel::decode(&bytes) {
                        Ok(parcel) => parcel,
                        Err(e) => {
                            tracing::error!(here = %self.here, error = %e, "dropping undecodable parcel");
                            continue;
                        }
                    };
                    let Some(server) = self.server.get().cloned() else {
                        tracing::error!(here = %self.here, "parcel before attach, dropping");
                        continue;
                    };
                    let Some(node) = self.me.upgrade() else { break };
                    let spawned = thread::Builder::new()
                        .name(format!("mesh-action-{}", self.here))
                        .spawn(move || {
                            let result = server.handle(parcel.action);
                            if let Some(seq) = seq {
                                node.send_ack(from, seq, &result);
                            }
                        });
                    if let Err(e) = spawned {
                        tracing::error!(here = %self.here, error = %e, "failed to spawn action thread");
                    }
                }
                WireMsg::Ack { seq, bytes } => {
                    let pending = self.pending.lock().remove(&seq);
                    match pending {
                        Some(ack) => {
                            match decode_result(&bytes) {
                                Ok(result) => *ack.result.lock() = Some(result),
                                Err(e) => {
                                    tracing::error!(here = %self.here, error = %e, "undecodable ack result");
                                }
                            }
                            ack.completion.signal();
                        }
                        None => {
                            tracing::warn!(here = %self.here, seq, "ack for unknown sequence");
                        }
                    }
                }
                WireMsg::Close => break,
            }
        }
        tracing::debug!(here = %self.here, "inbox closed");
    }

    fn peer(&self, dest: LocalityId) -> Option<&Sender<WireMsg>> {
        let peer = self.peers.get(dest.raw() as usize);
        if peer.is_none() {
            tracing::warn!(dest = %dest, "destination outside the mesh");
        }
        peer
    }

    fn send_ack(&self, to: LocalityId, seq: u64, result: &ActionResult) {
        let bytes = match encode_result(result) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode ack result");
                return;
            }
        };
        let Some(peer) = self.peer(to) else { return };
        if peer.send(WireMsg::Ack { seq, bytes }).is_err() {
            tracing::debug!(to = %to, "ack destination is gone");
        }
    }

    fn send_parcel(&self, dest: LocalityId, action: Action, seq: Option<u64>) {
        // basic (non-protocol) traffic to a peer blackens the sender; the
        // token and the acknowledgment events are the protocol itself and
        // must stay exempt, or no probe could ever return white
        let is_protocol = matches!(
            action,
            Action::DijkstraTermination { .. } | Action::SetEvent { .. }
        );
        if dest != self.here && !is_protocol {
            if let Some(server) = self.server.get() {
                server.dijkstra_make_black();
            }
        }

        let parcel = Parcel::new(dest, action);
        let bytes = match parcel.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode parcel");
                return;
            }
        };
        let Some(peer) = self.peer(dest) else { return };
        if peer
            .send(WireMsg::Parcel {
                from: self.here,
                seq,
                bytes,
            })
            .is_err()
        {
            tracing::debug!(dest = %dest, "parcel destination is gone");
        }
    }

    fn register_pending(&self, completion: &Completion) -> (u64, Arc<Mutex<Option<ActionResult>>>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let result = Arc::new(Mutex::new(None));
        self.pending.lock().insert(
            seq,
            PendingAck {
                completion: completion.clone(),
                result: Arc::clone(&result),
            },
        );
        (seq, result)
    }
}

impl ParcelSender for MeshNode {
    fn apply(&self, dest: LocalityId, action: Action) {
        self.send_parcel(dest, action, None);
    }

    fn apply_cb(&self, dest: LocalityId, action: Action) -> Completion {
        let completion = Completion::new(1);
        let (seq, _result) = self.register_pending(&completion);
        self.send_parcel(dest, action, Some(seq));
        completion
    }

    fn apply_sync(&self, dest: LocalityId, action: Action) -> ActionResult {
        let completion = Completion::new(1);
        let (seq, result) = self.register_pending(&completion);
        self.send_parcel(dest, action, Some(seq));
        completion.wait();
        let value = result.lock().take().unwrap_or(ActionResult::Ack);
        value
    }

    fn broadcast(&self, localities: &[LocalityId], action: Action) -> Completion {
        let completion = Completion::new(localities.len());
        for dest in localities {
            let (seq, _result) = self.register_pending(&completion);
            self.send_parcel(*dest, action.clone(), Some(seq));
        }
        completion
    }
}
