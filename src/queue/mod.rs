//! # Queues
//!
//! In-memory event queue and the typed sub-queues, one per trigger kind.
//! Every queue is keyed by event id and delivers each item once.

pub mod database;
pub mod errors;
pub mod event;
pub mod event_queue;
pub mod firehose;
pub mod http;
pub mod keyed;
pub mod rpc;
pub mod schedule;
pub mod set;

pub use database::{ChangeKind, DatabaseChange, DatabaseQueue};
pub use errors::{QueueError, QueueResult};
pub use event::{EnvVar, Event, EventType, Target, TargetContext, TargetKey};
pub use event_queue::{EventQueue, EventReceiver, PickupSignal};
pub use firehose::{
    FirehoseClient, FirehoseMessage, FirehosePayload, FirehosePool, FirehoseQueue, Outbound,
    SocketSender,
};
pub use http::{Header, HttpQueue, HttpRequest, ResponseChunk, ResponseReceiver};
pub use keyed::KeyedQueue;
pub use rpc::{ReplyReceiver, RpcCall, RpcQueue, RpcReply};
pub use schedule::{ScheduleQueue, ScheduleTick};
pub use set::QueueSet;
