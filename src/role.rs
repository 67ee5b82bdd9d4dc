//! Node roles and the rules for which roles may pair.

use std::fmt;

/// The declared purpose of one end of a connection.
///
/// Roles are exchanged in the handshake; a pairing the rules below forbid
/// fails connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeRole {
    Publisher = 1,
    Subscriber = 2,

    Responder = 3,
    Requester = 4,

    ServiceQueue = 5,
    ServiceQueueReader = 6,
    ServiceQueueWriter = 7,
}

impl NodeRole {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Publisher),
            2 => Some(Self::Subscriber),
            3 => Some(Self::Responder),
            4 => Some(Self::Requester),
            5 => Some(Self::ServiceQueue),
            6 => Some(Self::ServiceQueueReader),
            7 => Some(Self::ServiceQueueWriter),
            _ => None,
        }
    }

    /// Returns true if a node with this role may hold a connection whose far
    /// end declared `peer`.
    ///
    /// The relation is symmetric: `a.accepts(b) == b.accepts(a)`.
    pub fn accepts(self, peer: NodeRole) -> bool {
        use NodeRole::*;
        matches!(
            (self, peer),
            (Publisher, Subscriber)
                | (Subscriber, Publisher)
                | (Responder, Requester)
                | (Requester, Responder)
                | (ServiceQueueReader, ServiceQueueWriter)
                | (ServiceQueueWriter, ServiceQueueReader)
                | (ServiceQueue, ServiceQueueReader)
                | (ServiceQueue, ServiceQueueWriter)
                | (ServiceQueueReader, ServiceQueue)
                | (ServiceQueueWriter, ServiceQueue)
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Publisher => "publisher",
            NodeRole::Subscriber => "subscriber",
            NodeRole::Responder => "responder",
            NodeRole::Requester => "requester",
            NodeRole::ServiceQueue => "service-queue",
            NodeRole::ServiceQueueReader => "service-queue-reader",
            NodeRole::ServiceQueueWriter => "service-queue-writer",
        };
        f.write_str(name)
    }
}
