//! Dispatch ingress: control-message decode, timestamping, global ID
//! assignment, and model-session routing.

mod ingress;
mod sender;
mod worker;

pub use ingress::{DispatchIngress, GlobalIdIssuer, RequestEntrance};
pub use sender::send_control;
pub use worker::DispatchWorker;
