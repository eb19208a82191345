use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type SubjectId = Arc<str>;

/// Address of one cached query result: the query class plus its canonical
/// parameters. Invalidating a class stales every key that shares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub class: Arc<str>,
    pub params: Arc<str>,
}

impl QueryKey {
    pub fn class(class: &str) -> Self {
        Self {
            class: Arc::from(class),
            params: Arc::from("null"),
        }
    }

    /// Object keys serialize sorted, so equal params give equal keys.
    pub fn with_params(class: &str, params: &Value) -> Result<Self, serde_json::Error> {
        let params = serde_json::to_string(params)?;
        Ok(Self {
            class: Arc::from(class),
            params: Arc::from(params.as_str()),
        })
    }

    pub fn params_value(&self) -> Value {
        serde_json::from_str(&self.params).unwrap_or(Value::Null)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if &*self.params == "null" {
            f.write_str(&self.class)
        } else {
            write!(f, "{}{}", self.class, self.params)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: Value,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Admin,
}

/// The session identity the channel is opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: SubjectId,
    pub role: Role,
    pub credential: Arc<str>,
}

impl Identity {
    pub fn new(subject_id: &str, role: Role, credential: &str) -> Self {
        Self {
            subject_id: Arc::from(subject_id),
            role,
            credential: Arc::from(credential),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Personal(SubjectId),
    AdminBroadcast,
}

impl Room {
    /// Rooms an identity belongs to, personal room first.
    pub fn for_identity(identity: &Identity) -> Vec<Room> {
        let mut rooms = vec![Room::Personal(identity.subject_id.clone())];
        if identity.is_admin() {
            rooms.push(Room::AdminBroadcast);
        }
        rooms
    }

    pub fn join_msg(&self) -> ClientMsg {
        match self {
            Room::Personal(subject_id) => ClientMsg::Join {
                subject_id: subject_id.to_string(),
            },
            Room::AdminBroadcast => ClientMsg::JoinAdmin,
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Personal(subject_id) => write!(f, "personal:{subject_id}"),
            Room::AdminBroadcast => f.write_str("broadcast:admin"),
        }
    }
}

/// A named event pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// String field of the payload, if present.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMsg {
    Authenticate { token: String },
    Join { subject_id: String },
    JoinAdmin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMsg {
    Ready,
    Rejected { reason: String },
    Event(PushEvent),
}
