//! The wire format shared by nodes, clients and services.
//!
//! Every message is a JSON object `{"src", "dest", "body"}`. The body carries
//! an optional `msg_id`, an optional `in_reply_to` and a `type` tag that
//! selects the remaining fields, see [`Payload`].
use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorCode;
use crate::NodeId;

/// An envelope as exchanged over the substrate.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    /// Builds the envelope answering `self` with `payload`.
    pub fn reply(&self, msg_id: Option<u64>, payload: Payload) -> Message {
        Message {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body {
                msg_id,
                in_reply_to: self.body.msg_id,
                payload,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

/// A single entry of a topic's log, encoded as `[offset, msg]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogEntry(pub u64, pub i64);

impl LogEntry {
    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn msg(&self) -> i64 {
        self.1
    }
}

pub type Offsets = BTreeMap<String, u64>;

/// The kinds of message bodies, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Error {
        code: ErrorCode,
        #[serde(default)]
        text: String,
    },

    Generate,
    GenerateOk {
        id: String,
    },

    Broadcast {
        message: i64,
    },
    BroadcastOk,
    /// A batch of values travelling down the spanning tree.
    Gossip {
        messages: Vec<i64>,
    },
    GossipOk,
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,

    /// Read of all broadcast values, of the counter, or of a key-value
    /// service key, depending on the receiver.
    Read {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    ReadOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<i64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
    },

    Add {
        delta: i64,
    },
    AddOk,

    Send {
        key: String,
        msg: i64,
    },
    SendOk {
        offset: u64,
    },
    Poll {
        offsets: Offsets,
    },
    PollOk {
        msgs: BTreeMap<String, Vec<LogEntry>>,
    },
    CommitOffsets {
        offsets: Offsets,
    },
    CommitOffsetsOk,
    ListCommittedOffsets {
        keys: Vec<String>,
    },
    ListCommittedOffsetsOk {
        offsets: Offsets,
    },

    Write {
        key: String,
        value: i64,
    },
    WriteOk,
    Cas {
        key: String,
        from: i64,
        to: i64,
        #[serde(default)]
        create_if_not_exists: bool,
    },
    CasOk,

    /// Any body whose `type` is none of the above.
    #[serde(other)]
    Unknown,
}

impl Payload {
    /// The `type` tag this payload is encoded with.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Error { .. } => "error",
            Payload::Generate => "generate",
            Payload::GenerateOk { .. } => "generate_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Gossip { .. } => "gossip",
            Payload::GossipOk => "gossip_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Read { .. } => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Add { .. } => "add",
            Payload::AddOk => "add_ok",
            Payload::Send { .. } => "send",
            Payload::SendOk { .. } => "send_ok",
            Payload::Poll { .. } => "poll",
            Payload::PollOk { .. } => "poll_ok",
            Payload::CommitOffsets { .. } => "commit_offsets",
            Payload::CommitOffsetsOk => "commit_offsets_ok",
            Payload::ListCommittedOffsets { .. } => "list_committed_offsets",
            Payload::ListCommittedOffsetsOk { .. } => "list_committed_offsets_ok",
            Payload::Write { .. } => "write",
            Payload::WriteOk => "write_ok",
            Payload::Cas { .. } => "cas",
            Payload::CasOk => "cas_ok",
            Payload::Unknown => "unknown",
        }
    }

    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Payload::Error {
            code,
            text: text.into(),
        }
    }
}

/// The parts of a body that can be recovered even if the payload can't.
#[derive(Debug, Deserialize)]
pub(crate) struct RawMessage {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: RawBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBody {
    #[serde(default)]
    pub msg_id: Option<u64>,
    #[serde(default)]
    pub in_reply_to: Option<u64>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}
