//! i3pm Daemon
//!
//! Hides and restores i3/sway windows according to the active project.
//!
//! Responsibilities:
//! - Classify windows by the launch metadata in their process environment
//! - Hide windows of inactive projects in the scratchpad and bring them back
//!   to the workspace they came from
//! - Persist window placements across hide/restore cycles and restarts
//! - Serialize switch requests from RPC clients and tick events
//! - Track manual moves, new windows and closed windows from the event stream

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod filter;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod store;

pub use classifier::Classifier;
pub use config::Config;
pub use dispatcher::{DispatchSettings, Dispatcher, Flow};
pub use filter::{FilterEngine, FilterError, FilterSettings};
pub use queue::{QueueError, QueueWorker, SwitchExecutor, SwitchQueue};
pub use registry::{AppRegistry, ProjectCatalog};
pub use rpc::RpcContext;
pub use store::{SharedStore, StateStore, StoreError};
