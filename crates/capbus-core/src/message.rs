//! In-flight message: a queue node plus its delivery payload.
//!
//! A message is created by a transaction with its payload already copied
//! into the destination peer's pool slice. Two strong references exist
//! while the message is staged (queue + transaction); committed messages
//! are owned solely by the queue until dequeue. Delivery-failure notices
//! are messages of kind [`NodeKind::Notice`] with no slice attached.

use std::sync::Arc;

use capbus_types::{NodeKind, PeerId, SendFlags};

use crate::node::QueueNode;
use crate::pool::SliceRef;

/// Resource charge a message places on its destination's quota.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessageCharge {
    pub bytes: u64,
    pub slices: u32,
    pub handles: u32,
    pub descriptors: u32,
}

/// A queued message.
#[derive(Debug)]
pub struct Message {
    node: QueueNode,
    slice: Option<SliceRef>,
    n_handles: u32,
    descriptors: Vec<u32>,
    flags: SendFlags,
}

impl Message {
    /// New regular message with its slice already written.
    #[must_use]
    pub fn new(
        sender: PeerId,
        slice: SliceRef,
        n_handles: u32,
        descriptors: Vec<u32>,
        flags: SendFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: QueueNode::new(sender, NodeKind::Message),
            slice: Some(slice),
            n_handles,
            descriptors,
            flags,
        })
    }

    /// New delivery-failure notice attributed to `sender`.
    #[must_use]
    pub fn new_notice(sender: PeerId) -> Arc<Self> {
        Arc::new(Self {
            node: QueueNode::new(sender, NodeKind::Notice),
            slice: None,
            n_handles: 0,
            descriptors: Vec::new(),
            flags: SendFlags::default(),
        })
    }

    #[must_use]
    pub fn node(&self) -> &QueueNode {
        &self.node
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.node.kind()
    }

    #[must_use]
    pub fn sender(&self) -> PeerId {
        self.node.sender()
    }

    /// The pool slice carrying this message, if any.
    #[must_use]
    pub fn slice(&self) -> Option<SliceRef> {
        self.slice
    }

    #[must_use]
    pub fn n_handles(&self) -> u32 {
        self.n_handles
    }

    #[must_use]
    pub fn n_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn descriptors(&self) -> &[u32] {
        &self.descriptors
    }

    #[must_use]
    pub fn flags(&self) -> SendFlags {
        self.flags
    }

    /// The quota charge this message holds on its destination.
    #[must_use]
    pub fn charge(&self) -> MessageCharge {
        match self.slice {
            Some(slice) => MessageCharge {
                bytes: slice.size,
                slices: 1,
                handles: self.n_handles,
                descriptors: u32::try_from(self.descriptors.len()).unwrap_or(u32::MAX),
            },
            None => MessageCharge::default(),
        }
    }
}
