//! Cluster wire protocol.
//!
//! Every message between master and nodes is a single line of the form
//! `HEADER:BODY`, optionally `HEADER:BODY=ARG` for parameterised bodies.
//! Only the first `:` and the first `=` are delimiters, so client command
//! text may contain either. Messages never contain embedded newlines.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Body a primary-less node sends back on a tagged request, rewritten by the
/// coordinator into readable text before it reaches the client.
pub const REFUSED: &str = "ERR:NEG";

const CLIENT_PREFIX: &str = "CLIENT";

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request expecting an `ACK` (or `ERR`).
    Syn(Syn),
    /// A reply to a `SYN`.
    Ack(Ack),
    /// A protocol failure.
    Fault(Fault),
    /// A message tagged with a client session id; the body is the client's
    /// request (master to primary) or the store's reply (primary to master).
    Client { session: u64, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syn {
    /// Promote the receiving node to primary.
    Promote,
    /// Liveness ping.
    Status,
    /// Replicate this mutation on the backup.
    Diff(String),
    /// The primary's peer address, told to the backup by the master.
    Primary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Malformed message.
    Invalid,
    /// Unrecognised request.
    Unknown,
    /// Session-closed sentinel.
    Closed,
}

impl Message {
    pub fn client(session: u64, body: impl Into<String>) -> Self {
        Message::Client {
            session,
            body: body.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Syn(Syn::Promote) => write!(f, "SYN:PROM"),
            Message::Syn(Syn::Status) => write!(f, "SYN:STAT"),
            Message::Syn(Syn::Diff(request)) => write!(f, "SYN:DIFF={request}"),
            Message::Syn(Syn::Primary(addr)) => write!(f, "SYN:PRIM={addr}"),
            Message::Ack(Ack::Ok) => write!(f, "ACK:OK"),
            Message::Ack(Ack::Neg) => write!(f, "ACK:NEG"),
            Message::Fault(Fault::Invalid) => write!(f, "ERR:INVLD"),
            Message::Fault(Fault::Unknown) => write!(f, "ERR:UNKN"),
            Message::Fault(Fault::Closed) => write!(f, "ERR:CLOS"),
            Message::Client { session, body } => write!(f, "{CLIENT_PREFIX}{session}:{body}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message has no ':' delimiter")]
    MissingDelimiter,
    #[error("unknown header {0:?}")]
    UnknownHeader(String),
    #[error("unknown body {body:?} for header {header}")]
    UnknownBody { header: &'static str, body: String },
    #[error("invalid session id {0:?}")]
    BadSessionId(String),
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (header, body) = s.split_once(':').ok_or(ParseError::MissingDelimiter)?;
        match header {
            "SYN" => parse_syn(body),
            "ACK" => match body {
                "OK" => Ok(Message::Ack(Ack::Ok)),
                "NEG" => Ok(Message::Ack(Ack::Neg)),
                _ => Err(ParseError::UnknownBody {
                    header: "ACK",
                    body: body.to_string(),
                }),
            },
            "ERR" => match body {
                "INVLD" => Ok(Message::Fault(Fault::Invalid)),
                "UNKN" => Ok(Message::Fault(Fault::Unknown)),
                "CLOS" => Ok(Message::Fault(Fault::Closed)),
                _ => Err(ParseError::UnknownBody {
                    header: "ERR",
                    body: body.to_string(),
                }),
            },
            _ => match header.strip_prefix(CLIENT_PREFIX) {
                Some(digits) => {
                    let session = digits
                        .parse::<u64>()
                        .map_err(|_| ParseError::BadSessionId(digits.to_string()))?;
                    Ok(Message::Client {
                        session,
                        body: body.to_string(),
                    })
                }
                None => Err(ParseError::UnknownHeader(header.to_string())),
            },
        }
    }
}

fn parse_syn(body: &str) -> Result<Message, ParseError> {
    match body.split_once('=') {
        None => match body {
            "PROM" => Ok(Message::Syn(Syn::Promote)),
            "STAT" => Ok(Message::Syn(Syn::Status)),
            _ => Err(ParseError::UnknownBody {
                header: "SYN",
                body: body.to_string(),
            }),
        },
        Some(("DIFF", request)) => Ok(Message::Syn(Syn::Diff(request.to_string()))),
        Some(("PRIM", addr)) => Ok(Message::Syn(Syn::Primary(addr.to_string()))),
        Some(_) => Err(ParseError::UnknownBody {
            header: "SYN",
            body: body.to_string(),
        }),
    }
}
