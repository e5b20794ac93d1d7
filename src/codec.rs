//! Pipe-delimited wire format used between signallers.
//!
//! Every line is a sequence of `|` separated fields. The first field is a command prefixed with
//! `/`, the remaining ones are its arguments: plain strings are sent as is, everything else is
//! JSON encoded. Directed messages are prefixed with two additional fields: `/to|<target>|...`.
//!
//! ```text
//! /announce|{"id":"a1","room":"x"}
//! /request|{"id":"b2","__srcid":"a1","__reqid":"7f"}
//! /to|a1|/ackreq|7f|b2
//! /to|b2|/sdp|{"type":"offer","sdp":"v=0..."}|{"id":"a1"}
//! ```

use crate::connection::{IceCandidate, SessionDescription};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const SEPARATOR: char = '|';
const DIRECTED: &str = "/to";
const SOURCE_ID: &str = "__srcid";
const REQUEST_ID: &str = "__reqid";

/// Attribute map of a peer, sent in announcements and directory requests.
pub type Attributes = Map<String, Value>;

/// Closed set of messages understood by the signaller.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `/announce|<attributes>`
    Announce(Attributes),
    /// `/request|<criteria + __srcid + __reqid>`
    Request(DirectoryRequest),
    /// `/ackreq|<request id>|<responder id>`
    AckRequest {
        request_id: String,
        responder: String,
    },
    /// `/sdp|<description>[|{"id":<source>}]`
    Sdp {
        description: SessionDescription,
        source: Option<String>,
    },
    /// `/candidate|<candidate>[|{"id":<source>}]`
    Candidate {
        candidate: IceCandidate,
        source: Option<String>,
    },
    /// `/leave|{"id":<peer id>}`
    Leave { id: String },
    /// Any other command. String fields starting with `{` are decoded as JSON when possible.
    Custom { command: String, args: Vec<Value> },
}

impl Message {
    pub fn custom<S: Into<String>>(command: S, args: Vec<Value>) -> Self {
        Message::Custom {
            command: command.into(),
            args,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            Message::Announce(_) => "announce",
            Message::Request(_) => "request",
            Message::AckRequest { .. } => "ackreq",
            Message::Sdp { .. } => "sdp",
            Message::Candidate { .. } => "candidate",
            Message::Leave { .. } => "leave",
            Message::Custom { command, .. } => command,
        }
    }
}

/// Directory lookup: find peers whose attributes match all `criteria`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryRequest {
    pub criteria: Attributes,
    /// Id of the requesting peer.
    pub source: String,
    pub request_id: String,
}

impl DirectoryRequest {
    /// Checks if given attributes satisfy this request. Keys starting with `_` are not compared and
    /// an empty set of criteria matches every peer.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.criteria
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .all(|(key, expected)| attributes.get(key) == Some(expected))
    }
}

/// Message together with its optional recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub target: Option<String>,
    pub message: Message,
}

impl Envelope {
    pub fn broadcast(message: Message) -> Self {
        Envelope {
            target: None,
            message,
        }
    }

    pub fn directed<S: Into<String>>(target: S, message: Message) -> Self {
        Envelope {
            target: Some(target.into()),
            message,
        }
    }
}

/// Returns the recipient of a directed line without decoding the rest of it.
pub fn peek_target(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DIRECTED)?.strip_prefix(SEPARATOR)?;
    Some(rest.split(SEPARATOR).next().unwrap_or(rest))
}

pub fn encode(envelope: &Envelope) -> Result<String> {
    let mut fields: Vec<String> = Vec::new();
    if let Some(target) = &envelope.target {
        fields.push(DIRECTED.to_string());
        fields.push(target.clone());
    }
    fields.push(format!("/{}", envelope.message.command()));
    match &envelope.message {
        Message::Announce(attributes) => fields.push(serde_json::to_string(attributes)?),
        Message::Request(request) => {
            let mut payload = request.criteria.clone();
            payload.insert(SOURCE_ID.into(), Value::String(request.source.clone()));
            payload.insert(REQUEST_ID.into(), Value::String(request.request_id.clone()));
            fields.push(serde_json::to_string(&payload)?);
        }
        Message::AckRequest {
            request_id,
            responder,
        } => {
            fields.push(request_id.clone());
            fields.push(responder.clone());
        }
        Message::Sdp {
            description,
            source,
        } => {
            fields.push(serde_json::to_string(description)?);
            push_source(&mut fields, source)?;
        }
        Message::Candidate { candidate, source } => {
            fields.push(serde_json::to_string(candidate)?);
            push_source(&mut fields, source)?;
        }
        Message::Leave { id } => fields.push(serde_json::to_string(&source_value(id))?),
        Message::Custom { args, .. } => {
            for arg in args {
                match arg {
                    Value::Null => {}
                    Value::String(s) => fields.push(s.clone()),
                    other => fields.push(serde_json::to_string(other)?),
                }
            }
        }
    }
    Ok(fields.join("|"))
}

fn source_value(id: &str) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(id.to_string()));
    Value::Object(map)
}

fn push_source(fields: &mut Vec<String>, source: &Option<String>) -> Result<()> {
    if let Some(source) = source {
        fields.push(serde_json::to_string(&source_value(source))?);
    }
    Ok(())
}

pub fn decode(line: &str) -> Result<Envelope> {
    let mut fields = split_fields(line).into_iter();
    let mut command = command_name(fields.next())?;
    let mut target = None;
    if command == "to" {
        match fields.next() {
            Some(Value::String(id)) => target = Some(id),
            _ => return Err(Error::Codec("directed message without a target".into())),
        }
        command = command_name(fields.next())?;
    }
    let args: Vec<Value> = fields.collect();
    let message = match command.as_str() {
        "announce" => Message::Announce(object_arg(&args, 0)?),
        "request" => {
            let mut criteria: Attributes = object_arg(&args, 0)?;
            let source = take_string(&mut criteria, SOURCE_ID)?;
            let request_id = take_string(&mut criteria, REQUEST_ID)?;
            Message::Request(DirectoryRequest {
                criteria,
                source,
                request_id,
            })
        }
        "ackreq" => Message::AckRequest {
            request_id: string_arg(&args, 0)?,
            responder: string_arg(&args, 1)?,
        },
        "sdp" => Message::Sdp {
            description: object_arg(&args, 0)?,
            source: source_arg(&args, 1),
        },
        "candidate" => Message::Candidate {
            candidate: object_arg(&args, 0)?,
            source: source_arg(&args, 1),
        },
        "leave" => match args.first() {
            Some(Value::String(id)) => Message::Leave { id: id.clone() },
            _ => Message::Leave {
                id: source_arg(&args, 0)
                    .ok_or_else(|| Error::Codec("leave without peer id".into()))?,
            },
        },
        _ => Message::Custom { command, args },
    };
    Ok(Envelope { target, message })
}

fn command_name(field: Option<Value>) -> Result<String> {
    match field {
        Some(Value::String(s)) if s.starts_with('/') => Ok(s[1..].to_string()),
        _ => Err(Error::Codec("line doesn't start with a command".into())),
    }
}

fn object_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    match args.get(index) {
        Some(value @ Value::Object(_)) => Ok(serde_json::from_value(value.clone())?),
        Some(_) => Err(Error::Codec(format!("argument {} is not a JSON object", index))),
        None => Err(Error::Codec(format!("missing argument {}", index))),
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(Error::Codec(format!("missing argument {}", index))),
    }
}

fn source_arg(args: &[Value], index: usize) -> Option<String> {
    match args.get(index)?.get("id")? {
        Value::String(id) => Some(id.clone()),
        _ => None,
    }
}

fn take_string(map: &mut Attributes, key: &str) -> Result<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(Error::Codec(format!("missing `{}` field", key))),
    }
}

/// Splits a line into fields. A field starting with `{` is parsed as a JSON object (which may
/// itself contain `|` characters). If it's not valid JSON, it's kept as a plain string.
fn split_fields(line: &str) -> Vec<Value> {
    let mut fields = Vec::new();
    let mut rest = line;
    loop {
        if rest.starts_with('{') {
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            if let Some(Ok(value)) = stream.next() {
                let end = stream.byte_offset();
                let tail = &rest[end..];
                if tail.is_empty() || tail.starts_with(SEPARATOR) {
                    fields.push(value);
                    match tail.strip_prefix(SEPARATOR) {
                        Some(tail) => {
                            rest = tail;
                            continue;
                        }
                        None => break,
                    }
                }
            }
        }
        match rest.split_once(SEPARATOR) {
            Some((field, tail)) => {
                fields.push(Value::String(field.to_string()));
                rest = tail;
            }
            None => {
                fields.push(Value::String(rest.to_string()));
                break;
            }
        }
    }
    fields
}
