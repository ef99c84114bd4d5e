use super::error::DhtError;
use super::node::{
    decode_compact_nodes, decode_compact_peer, encode_compact_nodes, encode_compact_peer, Node,
};
use super::node_id::NodeId;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

impl DhtQuery {
    pub fn method(&self) -> &'static str {
        match self {
            DhtQuery::Ping => "ping",
            DhtQuery::FindNode { .. } => "find_node",
            DhtQuery::GetPeers { .. } => "get_peers",
            DhtQuery::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Body of an `r` message.
///
/// KRPC responses don't say which query they answer, so every field a
/// response may carry is here; the transaction tells the caller which ones
/// to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtResponse {
    pub id: NodeId,
    pub nodes: Vec<Node>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Bytes>,
}

impl DhtResponse {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            values: Vec::new(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Query { sender: NodeId, query: DhtQuery },
    /// A well-formed query for a method we don't implement.
    UnknownQuery { sender: NodeId, method: String },
    Response(DhtResponse),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    pub body: MessageBody,
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, sender: NodeId, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Query { sender, query },
        }
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Response(response),
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Id of the node that sent this message, when the message carries one.
    pub fn sender_id(&self) -> Option<NodeId> {
        match &self.body {
            MessageBody::Query { sender, .. } | MessageBody::UnknownQuery { sender, .. } => {
                Some(*sender)
            }
            MessageBody::Response(r) => Some(r.id),
            MessageBody::Error { .. } => None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;

        if value.as_dict().is_none() {
            return Err(DhtError::InvalidMessage("expected dict".into()));
        }

        let transaction_id = value
            .get_bytes(b"t")
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = value
            .get(b"y")
            .and_then(Value::as_str)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        let body = match msg_type {
            "q" => parse_query(&value)?,
            "r" => parse_response(&value)?,
            "e" => parse_error(&value)?,
            other => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(key(b"t"), Value::Bytes(self.transaction_id.clone()));

        match &self.body {
            MessageBody::Query { sender, query } => {
                dict.insert(key(b"y"), Value::string("q"));
                dict.insert(key(b"q"), Value::string(query.method()));
                dict.insert(key(b"a"), Value::Dict(query_args(sender, query)));
            }
            MessageBody::UnknownQuery { sender, method } => {
                let mut args = BTreeMap::new();
                args.insert(key(b"id"), id_value(sender));
                dict.insert(key(b"y"), Value::string("q"));
                dict.insert(key(b"q"), Value::string(method));
                dict.insert(key(b"a"), Value::Dict(args));
            }
            MessageBody::Response(response) => {
                dict.insert(key(b"y"), Value::string("r"));
                dict.insert(key(b"r"), Value::Dict(response_dict(response)));
            }
            MessageBody::Error { code, message } => {
                dict.insert(key(b"y"), Value::string("e"));
                dict.insert(
                    key(b"e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }

        encode(&Value::Dict(dict))
    }
}

fn key(k: &'static [u8]) -> Bytes {
    Bytes::from_static(k)
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn required_id(dict: &Value, field: &str) -> Result<NodeId, DhtError> {
    dict.get_bytes(field.as_bytes())
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage(format!("missing {}", field)))
}

fn parse_query(value: &Value) -> Result<MessageBody, DhtError> {
    let method = value
        .get(b"q")
        .and_then(Value::as_str)
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;

    let args = value
        .get(b"a")
        .filter(|a| a.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let sender = required_id(args, "id")?;

    let query = match method {
        "ping" => DhtQuery::Ping,
        "find_node" => DhtQuery::FindNode {
            target: required_id(args, "target")?,
        },
        "get_peers" => DhtQuery::GetPeers {
            info_hash: required_id(args, "info_hash")?,
        },
        "announce_peer" => {
            let info_hash = required_id(args, "info_hash")?;

            let port = args
                .get_integer(b"port")
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| DhtError::InvalidMessage("missing port".into()))?;

            let token = args
                .get_bytes(b"token")
                .cloned()
                .ok_or_else(|| DhtError::InvalidMessage("missing token".into()))?;

            let implied_port = args.get_integer(b"implied_port") == Some(1);

            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            }
        }
        other => {
            return Ok(MessageBody::UnknownQuery {
                sender,
                method: other.to_string(),
            })
        }
    };

    Ok(MessageBody::Query { sender, query })
}

fn parse_response(value: &Value) -> Result<MessageBody, DhtError> {
    let resp = value
        .get(b"r")
        .filter(|r| r.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

    let id = required_id(resp, "id")?;

    let nodes = resp
        .get_bytes(b"nodes")
        .map(|data| decode_compact_nodes(data))
        .unwrap_or_default();

    let values = resp
        .get(b"values")
        .and_then(Value::as_list)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_bytes)
                .filter_map(|b| decode_compact_peer(b))
                .collect()
        })
        .unwrap_or_default();

    let token = resp.get_bytes(b"token").cloned();

    Ok(MessageBody::Response(DhtResponse {
        id,
        nodes,
        values,
        token,
    }))
}

fn parse_error(value: &Value) -> Result<MessageBody, DhtError> {
    let error = value
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = error
        .first()
        .and_then(Value::as_integer)
        .unwrap_or(ERROR_GENERIC);

    let message = error
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    Ok(MessageBody::Error { code, message })
}

fn query_args(sender: &NodeId, query: &DhtQuery) -> BTreeMap<Bytes, Value> {
    let mut args = BTreeMap::new();
    args.insert(key(b"id"), id_value(sender));

    match query {
        DhtQuery::Ping => {}
        DhtQuery::FindNode { target } => {
            args.insert(key(b"target"), id_value(target));
        }
        DhtQuery::GetPeers { info_hash } => {
            args.insert(key(b"info_hash"), id_value(info_hash));
        }
        DhtQuery::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.insert(key(b"info_hash"), id_value(info_hash));
            args.insert(key(b"port"), Value::Integer(i64::from(*port)));
            args.insert(key(b"token"), Value::Bytes(token.clone()));
            if *implied_port {
                args.insert(key(b"implied_port"), Value::Integer(1));
            }
        }
    }

    args
}

fn response_dict(response: &DhtResponse) -> BTreeMap<Bytes, Value> {
    let mut resp = BTreeMap::new();
    resp.insert(key(b"id"), id_value(&response.id));

    if !response.nodes.is_empty() {
        resp.insert(
            key(b"nodes"),
            Value::Bytes(encode_compact_nodes(&response.nodes)),
        );
    }

    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .filter_map(encode_compact_peer)
            .map(|p| Value::Bytes(Bytes::copy_from_slice(&p)))
            .collect();
        resp.insert(key(b"values"), Value::List(values));
    }

    if let Some(token) = &response.token {
        resp.insert(key(b"token"), Value::Bytes(token.clone()));
    }

    resp
}
