//! Inference-serving core for a GPU model-serving platform.
//!
//! axon provides the two halves that make microsecond-scale serving work:
//!
//! - An InfiniBand/RoCE reliable-connection transport with out-of-band TCP
//!   bootstrapping, one memory registration per buffer pool, and a dedicated
//!   completion-queue poller per connection ([`rdma`]).
//! - A single-GPU batch-plan follower that executes externally scheduled
//!   plans at their intended start times under a strict no-overlap
//!   invariant ([`follower`]).
//!
//! The [`dispatch`] module glues the two together: control messages arriving
//! over RDMA are timestamped, assigned global IDs, and routed to
//! model-session queues.
//!
//! Uses raw `ibverbs-sys` FFI (no safe wrapper). The model framework, model
//! database, and device manager are external collaborators injected through
//! the [`follower::ModelExecutor`] and [`dispatch::RequestEntrance`] traits.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod follower;
pub mod memory;
pub mod protocol;
pub mod rdma;
mod util;

pub use config::{PollerType, RdmaConfig};
pub use dispatch::{DispatchIngress, DispatchWorker, GlobalIdIssuer, RequestEntrance};
pub use error::{AxonError, Result};
pub use executor::{ErrorCode, EventLoop, Timer};
pub use follower::{BatchPlan, ModelExecutor, PlanFollower, PlanQuery};
pub use memory::{BufferPool, MessageView, OwnedMemoryBlock};
pub use protocol::{ControlMessage, DispatchReply, DispatchRequest, DispatchStatus, QueryClock};
pub use rdma::{Connection, ExposedRegion, RdmaConnector, RdmaEventHandler};
