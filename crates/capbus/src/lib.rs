//! Public API facade for the capbus IPC bus.
//!
//! A [`Bus`] owns a set of peers, each with one ordered message queue and
//! one receive pool. Senders address peers by id and deliver through
//! transactions that keep multicast causally ordered across every
//! destination; receivers poll or block on their own queue.
//!
//! ```
//! use capbus::{Bus, SendRequest, CONNECT_FLAG_CLIENT};
//!
//! let bus = Bus::new();
//! let alice = bus.create_peer();
//! let bob = bus.create_peer();
//! bus.connect(alice, CONNECT_FLAG_CLIENT, 4096).unwrap();
//! bus.connect(bob, CONNECT_FLAG_CLIENT, 4096).unwrap();
//!
//! bus.send(
//!     alice,
//!     &SendRequest {
//!         destinations: &[bob],
//!         flags: 0,
//!         vecs: &[b"hello"],
//!         handles: &[],
//!         descriptors: &[],
//!     },
//! )
//! .unwrap();
//!
//! let msg = bus.recv(bob, 0).unwrap();
//! assert_eq!(msg.size, 5);
//! ```

mod bus;

pub use bus::{Bus, BusConfig, SendRequest};

pub use capbus_core::{
    FrontHint, Message, MessageQueue, Peer, PeerInfo, PeerRef, Pool, QuotaLimits, RecvMsg,
    SendReport, Transaction,
};
pub use capbus_error::{BusError, ErrorCode, Result};
pub use capbus_types::{
    ConnectMode, HandleId, NodeKind, PeerId, RecvFlags, SendFlags, Timestamp, CONNECT_FLAG_CLIENT,
    CONNECT_FLAG_QUERY, CONNECT_FLAG_RESET, FD_MAX, OFFSET_INVALID, RECV_FLAG_PEEK,
    SEND_FLAG_CONTINUE, SEND_FLAG_RELEASE, SEND_FLAG_SILENT, VEC_MAX,
};
