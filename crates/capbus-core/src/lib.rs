//! Queue, peer, and transaction engine for the capbus IPC bus.
//!
//! The heart of the crate is [`queue::MessageQueue`]: a per-peer ordered
//! multiset driven by a monotonic even-stepped clock, with a staging/commit
//! protocol that keeps readers behind unresolved transactions. Around it
//! sit the peer wrapper (lifecycle, pool, handle and descriptor tables,
//! quota) and the transaction driver that assigns one commit timestamp
//! across every destination of a multicast send.

pub mod active;
pub mod clock;
pub mod message;
pub mod node;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod quota;
pub mod tables;
pub mod transaction;
pub mod waitq;

pub use active::ActiveCounter;
pub use clock::Clock;
pub use message::{Message, MessageCharge};
pub use node::QueueNode;
pub use peer::{Peer, PeerInfo, PeerRef, PeerResources, RecvMsg};
pub use pool::{Pool, SliceRef};
pub use queue::{FrontHint, MessageQueue};
pub use quota::{Quota, QuotaLimits};
pub use tables::{DescriptorTable, HandleEntry, HandleTable};
pub use transaction::{DestinationResult, SendReport, Transaction};
pub use waitq::{WaitOutcome, WaitQueue};
