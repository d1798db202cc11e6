use std::io;

use crate::{Deserialize, LEN_TYPE_SIZE, LenType, NodeId, Serialize};

type HeaderLen = u32;
const HEADER_LEN_SIZE: usize = size_of::<HeaderLen>();

/// The application layer message exchanged between coordinators and the session controller,
/// and between peers during a peer round.
///
/// Payloads are already encoded by a `Codec`, the protocol never looks inside them.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// Client to server, asks to join the session.
    ClientConnected,
    /// Server to client, the answer to `ClientConnected`.
    NodeInfo {
        id: NodeId,
        wait_for_more_participants: bool,
        round: u64,
        participants: usize,
        min_participants: usize,
        payload: Vec<u8>,
    },
    /// Server to client broadcast, training may resume.
    EnoughParticipants,
    /// Server to client broadcast, training must pause until more nodes join.
    WaitingForMoreParticipants,
    /// Client to server, a contribution for the given round. Peers exchange their shares with it
    /// too.
    SendPayload {
        round: u64,
        communication_round: usize,
        payload: Vec<u8>,
    },
    /// Server to client, a global payload and the round it's the starting point of.
    ReceiveGlobalPayload {
        round: u64,
        communication_round: usize,
        participants: usize,
        payload: Vec<u8>,
    },
    /// Client to server, the node is ready to start a peer round.
    PeerIsReady,
    /// Server to client, the other nodes taking part in a peer round.
    PeersForRound { round: u64, peers: Vec<NodeId> },
    /// Either side, the connection is being closed on purpose.
    Disconnect,
    /// Either side, a human readable protocol error.
    Err(String),
}

/// Every field of a `Msg` except the raw payload, written as json.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Header {
    ClientConnected,
    NodeInfo {
        id: NodeId,
        wait_for_more_participants: bool,
        round: u64,
        participants: usize,
        min_participants: usize,
    },
    EnoughParticipants,
    WaitingForMoreParticipants,
    SendPayload {
        round: u64,
        communication_round: usize,
    },
    ReceiveGlobalPayload {
        round: u64,
        communication_round: usize,
        participants: usize,
    },
    PeerIsReady,
    PeersForRound {
        round: u64,
        peers: Vec<NodeId>,
    },
    Disconnect,
    Err {
        detail: String,
    },
}

impl Msg {
    /// A short name for this message's kind, handy for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::ClientConnected => "client_connected",
            Msg::NodeInfo { .. } => "node_info",
            Msg::EnoughParticipants => "enough_participants",
            Msg::WaitingForMoreParticipants => "waiting_for_more_participants",
            Msg::SendPayload { .. } => "send_payload",
            Msg::ReceiveGlobalPayload { .. } => "receive_global_payload",
            Msg::PeerIsReady => "peer_is_ready",
            Msg::PeersForRound { .. } => "peers_for_round",
            Msg::Disconnect => "disconnect",
            Msg::Err(_) => "err",
        }
    }

    /// Splits this message into it's json header and it's raw payload.
    fn header(&self) -> (Header, Option<&[u8]>) {
        match self {
            Msg::ClientConnected => (Header::ClientConnected, None),
            Msg::NodeInfo {
                id,
                wait_for_more_participants,
                round,
                participants,
                min_participants,
                payload,
            } => {
                let header = Header::NodeInfo {
                    id: id.clone(),
                    wait_for_more_participants: *wait_for_more_participants,
                    round: *round,
                    participants: *participants,
                    min_participants: *min_participants,
                };

                (header, Some(payload.as_slice()))
            }
            Msg::EnoughParticipants => (Header::EnoughParticipants, None),
            Msg::WaitingForMoreParticipants => (Header::WaitingForMoreParticipants, None),
            Msg::SendPayload {
                round,
                communication_round,
                payload,
            } => {
                let header = Header::SendPayload {
                    round: *round,
                    communication_round: *communication_round,
                };

                (header, Some(payload.as_slice()))
            }
            Msg::ReceiveGlobalPayload {
                round,
                communication_round,
                participants,
                payload,
            } => {
                let header = Header::ReceiveGlobalPayload {
                    round: *round,
                    communication_round: *communication_round,
                    participants: *participants,
                };

                (header, Some(payload.as_slice()))
            }
            Msg::PeerIsReady => (Header::PeerIsReady, None),
            Msg::PeersForRound { round, peers } => (
                Header::PeersForRound {
                    round: *round,
                    peers: peers.clone(),
                },
                None,
            ),
            Msg::Disconnect => (Header::Disconnect, None),
            Msg::Err(detail) => (
                Header::Err {
                    detail: detail.clone(),
                },
                None,
            ),
        }
    }

    /// Joins a parsed header with the raw payload that followed it.
    fn from_parts(header: Header, payload: &[u8]) -> io::Result<Self> {
        let msg = match header {
            Header::NodeInfo {
                id,
                wait_for_more_participants,
                round,
                participants,
                min_participants,
            } => Msg::NodeInfo {
                id,
                wait_for_more_participants,
                round,
                participants,
                min_participants,
                payload: payload.to_vec(),
            },
            Header::SendPayload {
                round,
                communication_round,
            } => Msg::SendPayload {
                round,
                communication_round,
                payload: payload.to_vec(),
            },
            Header::ReceiveGlobalPayload {
                round,
                communication_round,
                participants,
            } => Msg::ReceiveGlobalPayload {
                round,
                communication_round,
                participants,
                payload: payload.to_vec(),
            },
            _ if !payload.is_empty() => return Self::unexpected_payload(payload.len()),
            Header::ClientConnected => Msg::ClientConnected,
            Header::EnoughParticipants => Msg::EnoughParticipants,
            Header::WaitingForMoreParticipants => Msg::WaitingForMoreParticipants,
            Header::PeerIsReady => Msg::PeerIsReady,
            Header::PeersForRound { round, peers } => Msg::PeersForRound { round, peers },
            Header::Disconnect => Msg::Disconnect,
            Header::Err { detail } => Msg::Err(detail),
        };

        Ok(msg)
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_LEN_SIZE} bytes"),
        ))
    }

    fn header_out_of_bounds<T>(len: usize, available: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Header announces {len} bytes but only {available} are left"),
        ))
    }

    fn unexpected_payload<T>(len: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a {len} bytes payload on a message kind that carries none"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg {
    /// Writes `[frame len][header len][json header]`, the payload is left as the tail.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        let (header, payload) = self.header();
        let header = serde_json::to_vec(&header)?;

        let header_len = HeaderLen::try_from(header.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("header of {} bytes doesn't fit it's length prefix", header.len()),
            )
        })?;

        let payload_len = payload.map(<[u8]>::len).unwrap_or_default();
        let frame_len = (HEADER_LEN_SIZE + header.len() + payload_len) as LenType;

        buf.reserve(LEN_TYPE_SIZE + HEADER_LEN_SIZE + header.len());
        buf.extend_from_slice(&frame_len.to_be_bytes());
        buf.extend_from_slice(&header_len.to_be_bytes());
        buf.extend_from_slice(&header);

        Ok(payload)
    }
}

impl<'a> Deserialize<'a> for Msg {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_LEN_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (len_buf, rest) = buf.split_at(HEADER_LEN_SIZE);
        let mut len_bytes = [0; HEADER_LEN_SIZE];
        len_bytes.copy_from_slice(len_buf);
        let len = HeaderLen::from_be_bytes(len_bytes) as usize;

        if len > rest.len() {
            return Self::header_out_of_bounds(len, rest.len());
        }

        let (header, payload) = rest.split_at(len);
        let header: Header = serde_json::from_slice(header)?;
        Self::from_parts(header, payload)
    }
}
