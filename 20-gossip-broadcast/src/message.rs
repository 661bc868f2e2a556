use std::{collections::HashMap, fmt, io};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Number};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Maelstrom error code for a request type the node has no handler for.
pub const NOT_SUPPORTED: u32 = 10;

pub type NodeId = String;

/// 2^64, the first integral float past `u64::MAX`.
const U64_LIMIT: f64 = 18_446_744_073_709_551_616.0;
const I64_MIN: f64 = -9_223_372_036_854_775_808.0;

/// A broadcast value, compared by numeric value rather than by spelling.
///
/// Decoding folds an integral float (`42.0`, `-0.0`) into its integer form,
/// so `42` and `42.0` are one value and are written back as `42`. Fractional
/// floats are kept as they are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Value(Number);

impl Value {
    fn canonical(number: Number) -> Self {
        let Some(float) = number.as_f64().filter(|f| number.is_f64() && f.fract() == 0.0) else {
            return Self(number);
        };
        if (0.0..U64_LIMIT).contains(&float) {
            Self((float as u64).into())
        } else if (I64_MIN..0.0).contains(&float) {
            Self((float as i64).into())
        } else {
            Self(number)
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Number::deserialize(deserializer).map(Self::canonical)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    pub fn new(src: impl Into<NodeId>, dest: impl Into<NodeId>, body: Body) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.body.in_reply_to.is_some()
    }
}

/// Message body with the routing fields pulled out and the rest kept raw.
///
/// Handlers decode `fields` into a [`Payload`] only once they know which
/// request they are serving, so a malformed body fails inside its handler
/// rather than at the framing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, serde_json::Value>,
}

impl Body {
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let mut fields = match serde_json::to_value(payload).context("failed to encode payload")? {
            serde_json::Value::Object(fields) => fields,
            other => bail!("payload encoded to a non-object: {other}"),
        };
        let kind = match fields.remove("type") {
            Some(serde_json::Value::String(kind)) => kind,
            _ => return Err(anyhow!("payload encoded without a type tag")),
        };
        Ok(Self {
            kind,
            msg_id: None,
            in_reply_to: None,
            fields,
        })
    }

    pub fn payload(&self) -> Result<Payload> {
        let mut fields = self.fields.clone();
        fields.insert("type".into(), serde_json::Value::String(self.kind.clone()));
        serde_json::from_value(serde_json::Value::Object(fields))
            .with_context(|| format!("failed to decode {} body", self.kind))
    }
}

/// Every body this node sends or understands. The `type` tag is the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Broadcast {
        message: Value,
    },
    BroadcastOk,
    BroadcastNotOkay,
    Read,
    ReadOk {
        messages: Vec<Value>,
    },
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,
    Error {
        code: u32,
        text: String,
    },
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One flush per line; Maelstrom reads stdout line by line.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
