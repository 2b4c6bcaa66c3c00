//! Envelope construction and validation.
//!
//! An envelope is a CBOR map whose keys are small unsigned integers (tags),
//! not field names — this keeps the wire format compact and lets unknown
//! tags be ignored for forward compatibility. See the tag table below.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ciborium::value::Value;
use rand::RngCore;

use crate::{ProtocolError, Result, MAX_NICK_CHARS, MAX_ROOM_NAME_CHARS, PROTOCOL_VERSION};

const TAG_VERSION: u64 = 0;
const TAG_TYPE: u64 = 1;
const TAG_ID: u64 = 2;
const TAG_TIMESTAMP: u64 = 3;
const TAG_SOURCE: u64 = 4;
const TAG_ROOM: u64 = 5;
const TAG_BODY: u64 = 6;
const TAG_NICK: u64 = 7;

/// Message-type codes (tag 1). Unknown codes are preserved as
/// [`MessageType::Unknown`] so the dispatcher can ignore them rather than
/// reject the whole envelope — this is the tagged-union replacement for an
/// if/else chain on the raw integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Welcome,
    Join,
    Joined,
    Part,
    Parted,
    Msg,
    Notice,
    Ping,
    Pong,
    Error,
    ResourceEnvelope,
    Unknown(u64),
}

impl MessageType {
    pub fn code(self) -> u64 {
        match self {
            MessageType::Hello => 1,
            MessageType::Welcome => 2,
            MessageType::Join => 10,
            MessageType::Joined => 11,
            MessageType::Part => 12,
            MessageType::Parted => 13,
            MessageType::Msg => 20,
            MessageType::Notice => 21,
            MessageType::Ping => 30,
            MessageType::Pong => 31,
            MessageType::Error => 40,
            MessageType::ResourceEnvelope => 50,
            MessageType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            1 => MessageType::Hello,
            2 => MessageType::Welcome,
            10 => MessageType::Join,
            11 => MessageType::Joined,
            12 => MessageType::Part,
            13 => MessageType::Parted,
            20 => MessageType::Msg,
            21 => MessageType::Notice,
            30 => MessageType::Ping,
            31 => MessageType::Pong,
            40 => MessageType::Error,
            50 => MessageType::ResourceEnvelope,
            other => MessageType::Unknown(other),
        }
    }
}

/// The envelope body (tag 6), restricted to the primitive kinds the
/// protocol supports. Structured payloads (HELLO/WELCOME/JOINED/PARTED/
/// RESOURCE_ENVELOPE) are `Map` values whose own keys are the numeric
/// sub-tags documented on each constructor below.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Text(String),
    Int(i64),
    Bool(bool),
    Blob(Vec<u8>),
    Map(BTreeMap<u64, Body>),
    List(Vec<Body>),
}

impl Body {
    fn to_value(&self) -> Value {
        match self {
            Body::Text(s) => Value::Text(s.clone()),
            Body::Int(i) => Value::Integer((*i).into()),
            Body::Bool(b) => Value::Bool(*b),
            Body::Blob(b) => Value::Bytes(b.clone()),
            Body::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| (Value::Integer((*k).into()), v.to_value()))
                    .collect(),
            ),
            Body::List(items) => Value::Array(items.iter().map(Body::to_value).collect()),
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(Body::Text(s.clone())),
            Value::Integer(i) => {
                let i: i128 = (*i).into();
                let i = i64::try_from(i)
                    .map_err(|_| ProtocolError::BadField("body integer out of range".into()))?;
                Ok(Body::Int(i))
            }
            Value::Bool(b) => Ok(Body::Bool(*b)),
            Value::Bytes(b) => Ok(Body::Blob(b.clone())),
            Value::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    let key = value_as_u64(k)
                        .ok_or_else(|| ProtocolError::BadField("body map key must be uint".into()))?;
                    out.insert(key, Body::from_value(v)?);
                }
                Ok(Body::Map(out))
            }
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(Body::from_value)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Body::List(items))
            }
            other => Err(ProtocolError::BadField(format!(
                "unsupported body primitive kind: {other:?}"
            ))),
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<u64, Body>> {
        match self {
            Body::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Body]> {
        match self {
            Body::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Body::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Body::Int(i) => Some(*i),
            _ => None,
        }
    }
}

fn value_as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Integer(i) => u64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

/// An RRC protocol envelope: a typed map of integer-tagged fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u64,
    pub msg_type: MessageType,
    pub id: [u8; 8],
    pub timestamp: u64,
    pub source: Vec<u8>,
    pub room: Option<String>,
    pub body: Option<Body>,
    pub nick: Option<String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn random_id() -> [u8; 8] {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// Construct an envelope, filling in version/id/timestamp if unspecified.
#[allow(clippy::too_many_arguments)]
pub fn make_envelope(
    msg_type: MessageType,
    source: Vec<u8>,
    room: Option<String>,
    body: Option<Body>,
    nick: Option<String>,
    id: Option<[u8; 8]>,
    ts: Option<u64>,
) -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        msg_type,
        id: id.unwrap_or_else(random_id),
        timestamp: ts.unwrap_or_else(now_ms),
        source,
        room,
        body,
        nick,
    }
}

impl Envelope {
    /// Validate field bounds that the typed struct alone can't enforce:
    /// protocol version, source-identity length, and room/nick character
    /// bounds. Called both after decoding off the wire and before sending
    /// an envelope this process constructed.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(self.version));
        }
        if self.id.len() != 8 {
            return Err(ProtocolError::BadField("id must be exactly 8 bytes".into()));
        }
        if !matches!(self.source.len(), 16 | 32) {
            return Err(ProtocolError::BadField(format!(
                "source identity has unexpected length: {} bytes",
                self.source.len()
            )));
        }
        if let Some(room) = &self.room {
            if room.is_empty() || room.chars().count() > MAX_ROOM_NAME_CHARS {
                return Err(ProtocolError::BadField(
                    "room name must be 1..=64 characters".into(),
                ));
            }
        }
        if let Some(nick) = &self.nick {
            if nick.is_empty() || nick.chars().count() > MAX_NICK_CHARS {
                return Err(ProtocolError::BadField(
                    "nick must be 1..=32 characters".into(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::Integer(TAG_VERSION.into()), Value::Integer(self.version.into())),
            (
                Value::Integer(TAG_TYPE.into()),
                Value::Integer(self.msg_type.code().into()),
            ),
            (Value::Integer(TAG_ID.into()), Value::Bytes(self.id.to_vec())),
            (
                Value::Integer(TAG_TIMESTAMP.into()),
                Value::Integer(self.timestamp.into()),
            ),
            (
                Value::Integer(TAG_SOURCE.into()),
                Value::Bytes(self.source.clone()),
            ),
        ];
        if let Some(room) = &self.room {
            entries.push((Value::Integer(TAG_ROOM.into()), Value::Text(room.clone())));
        }
        if let Some(body) = &self.body {
            entries.push((Value::Integer(TAG_BODY.into()), body.to_value()));
        }
        if let Some(nick) = &self.nick {
            entries.push((Value::Integer(TAG_NICK.into()), Value::Text(nick.clone())));
        }
        Value::Map(entries)
    }

    pub(crate) fn from_value(value: &Value) -> Result<Self> {
        let entries = match value {
            Value::Map(entries) => entries,
            _ => return Err(ProtocolError::Malformed("envelope must be a map".into())),
        };

        let mut fields: BTreeMap<u64, &Value> = BTreeMap::new();
        for (k, v) in entries {
            let key = value_as_u64(k)
                .ok_or_else(|| ProtocolError::Malformed("envelope keys must be unsigned integers".into()))?;
            fields.insert(key, v);
        }

        let version = take_uint(&fields, TAG_VERSION, "version")?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }

        let msg_type = MessageType::from_code(take_uint(&fields, TAG_TYPE, "type")?);
        let timestamp = take_uint(&fields, TAG_TIMESTAMP, "timestamp")?;

        let id_bytes = take_bytes(&fields, TAG_ID, "id")?;
        if id_bytes.len() != 8 {
            return Err(ProtocolError::BadField("id must be exactly 8 bytes".into()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&id_bytes);

        let source = take_bytes(&fields, TAG_SOURCE, "source")?;
        if !matches!(source.len(), 16 | 32) {
            return Err(ProtocolError::BadField(format!(
                "source identity has unexpected length: {} bytes",
                source.len()
            )));
        }

        let room = match fields.get(&TAG_ROOM) {
            Some(v) => {
                let s = value_as_text(v, "room")?;
                if s.is_empty() || s.chars().count() > MAX_ROOM_NAME_CHARS {
                    return Err(ProtocolError::BadField(
                        "room name must be 1..=64 characters".into(),
                    ));
                }
                Some(s)
            }
            None => None,
        };

        let nick = match fields.get(&TAG_NICK) {
            Some(v) => {
                let s = value_as_text(v, "nick")?;
                if s.is_empty() || s.chars().count() > MAX_NICK_CHARS {
                    return Err(ProtocolError::BadField(
                        "nick must be 1..=32 characters".into(),
                    ));
                }
                Some(s)
            }
            None => None,
        };

        let body = match fields.get(&TAG_BODY) {
            Some(v) => Some(Body::from_value(v)?),
            None => None,
        };

        Ok(Envelope {
            version,
            msg_type,
            id,
            timestamp,
            source,
            room,
            body,
            nick,
        })
    }
}

fn take_uint(fields: &BTreeMap<u64, &Value>, tag: u64, name: &str) -> Result<u64> {
    let v = fields
        .get(&tag)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing required field {name}")))?;
    value_as_u64(v).ok_or_else(|| ProtocolError::Malformed(format!("{name} must be an unsigned integer")))
}

fn take_bytes(fields: &BTreeMap<u64, &Value>, tag: u64, name: &str) -> Result<Vec<u8>> {
    let v = fields
        .get(&tag)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing required field {name}")))?;
    match v {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ProtocolError::Malformed(format!("{name} must be bytes"))),
    }
}

fn value_as_text(v: &Value, name: &str) -> Result<String> {
    match v {
        Value::Text(s) => Ok(s.clone()),
        _ => Err(ProtocolError::Malformed(format!("{name} must be a string"))),
    }
}

/// Construct a HELLO body: `{0: client_name, 1: client_version, 2: capabilities}`.
pub fn hello_body(client_name: &str, client_version: &str, capabilities: Vec<String>) -> Body {
    let mut m = BTreeMap::new();
    m.insert(0, Body::Text(client_name.to_string()));
    m.insert(1, Body::Text(client_version.to_string()));
    m.insert(
        2,
        Body::List(capabilities.into_iter().map(Body::Text).collect()),
    );
    Body::Map(m)
}

/// Construct a WELCOME body: `{0: hub_name, 1: hub_version, 2: capabilities}`.
pub fn welcome_body(hub_name: &str, hub_version: &str, capabilities: Vec<String>) -> Body {
    let mut m = BTreeMap::new();
    m.insert(0, Body::Text(hub_name.to_string()));
    m.insert(1, Body::Text(hub_version.to_string()));
    m.insert(
        2,
        Body::List(capabilities.into_iter().map(Body::Text).collect()),
    );
    Body::Map(m)
}

/// Construct a JOINED/PARTED body: `{0: [member identity digests]}`.
pub fn members_body(members: Vec<Vec<u8>>) -> Body {
    let mut m = BTreeMap::new();
    m.insert(0, Body::List(members.into_iter().map(Body::Blob).collect()));
    Body::Map(m)
}

/// Parse a JOINED/PARTED body's member list, if shaped as expected.
pub fn parse_members_body(body: &Body) -> Option<Vec<Vec<u8>>> {
    let members = body.as_map()?.get(&0)?.as_list()?;
    members.iter().map(|b| b.as_blob().map(|b| b.to_vec())).collect()
}

/// A parsed RESOURCE_ENVELOPE body.
#[derive(Clone, Debug)]
pub struct ResourceEnvelopeBody {
    pub resource_id: Vec<u8>,
    pub kind: String,
    pub size: u64,
    pub sha256: Option<Vec<u8>>,
    pub encoding: Option<String>,
}

/// Construct a RESOURCE_ENVELOPE body:
/// `{0: resource_id, 1: kind, 2: size, 3: sha256?, 4: encoding?}`.
pub fn resource_envelope_body(
    resource_id: Vec<u8>,
    kind: &str,
    size: u64,
    sha256: Option<Vec<u8>>,
    encoding: Option<String>,
) -> Body {
    let mut m = BTreeMap::new();
    m.insert(0, Body::Blob(resource_id));
    m.insert(1, Body::Text(kind.to_string()));
    m.insert(2, Body::Int(size as i64));
    if let Some(sha) = sha256 {
        m.insert(3, Body::Blob(sha));
    }
    if let Some(enc) = encoding {
        m.insert(4, Body::Text(enc));
    }
    Body::Map(m)
}

/// Parse a RESOURCE_ENVELOPE body, validating the field kinds/bounds that
/// Client inbound handling requires (size must be a positive integer).
pub fn parse_resource_envelope_body(body: &Body) -> Result<ResourceEnvelopeBody> {
    let map = body
        .as_map()
        .ok_or_else(|| ProtocolError::BadField("resource envelope body must be a map".into()))?;

    let resource_id = map
        .get(&0)
        .and_then(Body::as_blob)
        .ok_or_else(|| ProtocolError::BadField("resource envelope missing id blob".into()))?
        .to_vec();

    let kind = map
        .get(&1)
        .and_then(Body::as_text)
        .ok_or_else(|| ProtocolError::BadField("resource envelope missing kind string".into()))?
        .to_string();

    let size = map
        .get(&2)
        .and_then(Body::as_int)
        .ok_or_else(|| ProtocolError::BadField("resource envelope missing size".into()))?;
    if size <= 0 {
        return Err(ProtocolError::BadField("resource size must be positive".into()));
    }

    let sha256 = map.get(&3).and_then(Body::as_blob).map(|b| b.to_vec());
    let encoding = map.get(&4).and_then(Body::as_text).map(|s| s.to_string());

    Ok(ResourceEnvelopeBody {
        resource_id,
        kind,
        size: size as u64,
        sha256,
        encoding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn src16() -> Vec<u8> {
        vec![7u8; 16]
    }

    #[test]
    fn make_envelope_fills_defaults() {
        let env = make_envelope(MessageType::Ping, src16(), None, None, None, None, None);
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.id.len(), 8);
        assert!(env.timestamp > 0);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn roundtrip_through_codec() {
        let env = make_envelope(
            MessageType::Msg,
            src16(),
            Some("general".into()),
            Some(Body::Text("hello".into())),
            Some("alice".into()),
            None,
            None,
        );
        let bytes = codec::encode(&env).expect("encode");
        let decoded = codec::decode(&bytes).expect("decode");
        assert_eq!(decoded, env);
    }

    #[test]
    fn rejects_bad_version() {
        let mut env = make_envelope(MessageType::Ping, src16(), None, None, None, None, None);
        env.version = 2;
        let bytes_map = env.to_value();
        let mut buf = Vec::new();
        ciborium::into_writer(&bytes_map, &mut buf).expect("encode");
        let err = codec::decode(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::BadVersion(2)));
    }

    #[test]
    fn rejects_bad_source_length() {
        let env = make_envelope(MessageType::Ping, vec![1, 2, 3], None, None, None, None, None);
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_room_out_of_bounds() {
        let long_room = "x".repeat(65);
        let env = make_envelope(
            MessageType::Join,
            src16(),
            Some(long_room),
            None,
            None,
            None,
            None,
        );
        assert!(env.validate().is_err());
    }

    #[test]
    fn unknown_message_type_round_trips() {
        let env = make_envelope(MessageType::Unknown(999), src16(), None, None, None, None, None);
        let bytes = codec::encode(&env).expect("encode");
        let decoded = codec::decode(&bytes).expect("decode");
        assert_eq!(decoded.msg_type, MessageType::Unknown(999));
    }

    #[test]
    fn members_body_round_trips() {
        let body = members_body(vec![vec![1; 16], vec![2; 16]]);
        let members = parse_members_body(&body).expect("parse");
        assert_eq!(members, vec![vec![1u8; 16], vec![2u8; 16]]);
    }

    #[test]
    fn resource_envelope_body_round_trips() {
        let body = resource_envelope_body(vec![1], "notice", 200, Some(vec![9; 32]), None);
        let parsed = parse_resource_envelope_body(&body).expect("parse");
        assert_eq!(parsed.kind, "notice");
        assert_eq!(parsed.size, 200);
        assert_eq!(parsed.sha256, Some(vec![9u8; 32]));
    }

    #[test]
    fn resource_envelope_rejects_non_positive_size() {
        let body = resource_envelope_body(vec![1], "notice", 0, None, None);
        // size 0 was clamped through i64 cast; force a negative one directly.
        let mut map = body.as_map().unwrap().clone();
        map.insert(2, Body::Int(-1));
        let bad = Body::Map(map);
        assert!(parse_resource_envelope_body(&bad).is_err());
    }
}
