use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};

/// Current wall-clock time in Unix milliseconds
pub fn timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Envelope kind; absent on plain data messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Register,
    Registered,
    Unregister,
    GetClients,
    ClientList,
    GetStats,
    Stats,
    Ping,
    Pong,
    Error,
    ClientJoined,
    ClientLeft,
    Disconnected,
    BroadcastAck,
}

impl Kind {
    /// Kinds that only the broker emits
    pub fn is_broker_only(self) -> bool {
        matches!(
            self,
            Kind::Registered
                | Kind::ClientList
                | Kind::Stats
                | Kind::Pong
                | Kind::ClientJoined
                | Kind::ClientLeft
                | Kind::Disconnected
                | Kind::BroadcastAck
        )
    }
}

/// Opaque correlation id, echoed back by whoever answers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Text(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

/// Where a data envelope wants to go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Direct(&'a str),
    Broadcast,
}

/// The only structure that crosses a port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl Envelope {
    /// Bare envelope of the given kind
    pub fn of(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn register(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of(Kind::Register)
        }
    }

    pub fn unregister() -> Self {
        Self::of(Kind::Unregister)
    }

    /// Point-to-point data message
    pub fn to(target: impl Into<String>, data: Value) -> Self {
        Self {
            to: Some(target.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Fan-out data message
    pub fn broadcast(data: Value) -> Self {
        Self {
            broadcast: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// System envelope with a typed payload in `data`
    pub fn system<T: Serialize>(kind: Kind, payload: &T) -> Result<Self> {
        Ok(Self {
            data: Some(serde_json::to_value(payload)?),
            ..Self::of(kind)
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            code: Some(code),
            ..Self::of(Kind::Error)
        }
    }

    pub fn with_request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_target(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(timestamp());
        self
    }

    /// Plain data message (no kind)
    pub fn is_data(&self) -> bool {
        self.kind.is_none()
    }

    /// Resolve the routing of a data or error-reply envelope.
    ///
    /// Exactly one of `to` and `broadcast` must be set.
    pub fn route(&self) -> std::result::Result<Route<'_>, &'static str> {
        match (self.to.as_deref(), self.broadcast) {
            (Some(_), true) => Err("Message cannot have both 'to' and 'broadcast'"),
            (Some(""), false) => Err("Message 'to' must not be empty"),
            (Some(to), false) => Ok(Route::Direct(to)),
            (None, true) => Ok(Route::Broadcast),
            (None, false) => Err("Message must have 'to' or 'broadcast'"),
        }
    }

    /// Decode the `data` payload into a typed value
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.data.clone().ok_or(Error::MissingPayload)?;
        serde_json::from_value(data).map_err(Error::from)
    }

    /// The `type` discriminator of an application payload, if any
    pub fn payload_type(&self) -> Option<&str> {
        self.data.as_ref()?.get("type")?.as_str()
    }
}
