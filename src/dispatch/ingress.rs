//! Routing of inbound dispatch requests to model-session queues.

use crate::clock;
use crate::protocol::{DispatchReply, DispatchRequest, DispatchStatus, QueryEcho};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide monotonic query ID source.
///
/// Constructor-injected wherever IDs are assigned; the embedding decides
/// whether one issuer spans multiple workers.
pub struct GlobalIdIssuer {
    next: AtomicU64,
}

impl GlobalIdIssuer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for GlobalIdIssuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Entrance to one model session's query queue.
///
/// The scheduler that drains the queue and builds batch plans is an
/// external collaborator; the ingress only needs to hand queries over.
pub trait RequestEntrance: Send + Sync {
    fn model_index(&self) -> u32;

    /// Accept one query. A non-OK status is reported back to the sender.
    fn enqueue(&self, query: DispatchRequest) -> DispatchStatus;
}

/// Stamps, numbers, and routes dispatch requests.
pub struct DispatchIngress {
    global_ids: Arc<GlobalIdIssuer>,
    entrances: Mutex<Vec<Option<Arc<dyn RequestEntrance>>>>,
}

impl DispatchIngress {
    pub fn new(global_ids: Arc<GlobalIdIssuer>) -> Self {
        Self {
            global_ids,
            entrances: Mutex::new(Vec::new()),
        }
    }

    /// Install a model-session entrance, growing the table as needed.
    pub fn add_model_session(&self, entrance: Arc<dyn RequestEntrance>) {
        let index = entrance.model_index() as usize;
        let mut table = self.entrances.lock().expect("entrance table poisoned");
        if table.len() <= index {
            table.resize_with(index + 1, || None);
        }
        table[index] = Some(entrance);
        tracing::info!(model_index = index, "installed model session entrance");
    }

    /// Handle one dispatch: stamp the punch clock, assign a global ID,
    /// enqueue. Returns a reply only when the dispatch failed — success is
    /// silent.
    ///
    /// `dispatcher_recv_ns` is captured by the caller at message ingress,
    /// before parsing; the sched stamp is taken here, right before the
    /// enqueue.
    pub fn handle_dispatch(
        &self,
        mut request: DispatchRequest,
        dispatcher_recv_ns: u64,
    ) -> Option<DispatchReply> {
        request.clock.dispatcher_recv_ns = dispatcher_recv_ns;
        request.clock.dispatcher_sched_ns = clock::now_ns();
        request.global_id = self.global_ids.next_id();

        let model_index = request.model_index;
        let query_id = request.query_id;
        let echo_clock = request.clock;

        let entrance = {
            let table = self.entrances.lock().expect("entrance table poisoned");
            table.get(model_index as usize).and_then(Clone::clone)
        };

        let status = match entrance {
            Some(entrance) => entrance.enqueue(request),
            None => {
                tracing::warn!(model_index, "dispatch for unknown model session");
                DispatchStatus::ModelNotFound
            }
        };

        if status == DispatchStatus::Ok {
            None
        } else {
            Some(DispatchReply {
                status,
                model_index,
                query_list: vec![QueryEcho {
                    query_id,
                    clock: echo_clock,
                }],
            })
        }
    }
}
