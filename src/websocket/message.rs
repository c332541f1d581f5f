use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events pushed by the platform, keyed by the `event` field.
///
/// Payload shapes follow the server's event registry. Anything the client
/// does not recognise (or cannot decode) becomes [`Event::Unknown`]; the raw
/// payload is still available on the [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ScoreboardUpdated {
        contest: String,
        updated_at: String,
    },
    ScoreboardSnapshot {
        contest: String,
        entries: Vec<Value>,
        #[serde(default)]
        top_limit: Option<u32>,
        #[serde(default)]
        generated_at: Option<String>,
        #[serde(default)]
        ignore_freeze: Option<bool>,
    },
    SubmissionAccepted {
        contest: String,
        challenge: String,
        awarded_points: i64,
        #[serde(default)]
        bonus_points: Option<i64>,
        #[serde(default)]
        blood_rank: Option<u32>,
        #[serde(default)]
        team_id: Option<i64>,
    },
    FirstBlood {
        contest: String,
        challenge: String,
        user_id: i64,
        #[serde(default)]
        team_id: Option<i64>,
    },
    AnnouncementPublished {
        contest: String,
        announcement_id: i64,
        title: String,
    },
    ChallengeCreated {
        contest: String,
        challenge: String,
        data: Value,
    },
    ChallengeUpdated {
        contest: String,
        challenge: String,
        data: Value,
        #[serde(default)]
        operator_id: Option<i64>,
    },
    HintUnlocked {
        contest: String,
        challenge: String,
        hint_id: i64,
        #[serde(default)]
        user_id: Option<i64>,
        #[serde(default)]
        team_id: Option<i64>,
        #[serde(default)]
        cost: Option<i64>,
        #[serde(default)]
        hint: Option<Value>,
    },
    TeamCreated {
        contest: String,
        team: Value,
        team_id: i64,
        member_count: u32,
        member: Value,
    },
    TeamJoined {
        contest: String,
        team: Value,
        team_id: i64,
        user_id: i64,
        member_count: u32,
        member: Value,
        #[serde(default)]
        members: Option<Vec<Value>>,
        #[serde(default)]
        has_more_members: Option<bool>,
    },
    TeamLeft {
        contest: String,
        team: Value,
        team_id: i64,
        user_id: i64,
        member_count: u32,
        member: Value,
        #[serde(default)]
        members: Option<Vec<Value>>,
        #[serde(default)]
        has_more_members: Option<bool>,
    },
    TeamDisbanded {
        contest: String,
        team: Value,
        team_id: i64,
        #[serde(default)]
        members: Option<Vec<Value>>,
        #[serde(default)]
        member_count: Option<u32>,
    },
    TeamInviteReset {
        contest: String,
        team: Value,
        team_id: i64,
        invite_token: String,
        #[serde(default)]
        member_count: Option<u32>,
    },
    TeamTransferred {
        contest: String,
        team: Value,
        team_id: i64,
        old_captain: Value,
        new_captain: Value,
    },
    MachineStarted(MachineEvent),
    MachineStopped(MachineEvent),
    MachineFailed(MachineEvent),
    MachineStatus(MachineEvent),
    ForceLogout {
        reason: String,
    },
    /// Server reply to the client keepalive
    Pong {
        #[serde(default)]
        ts: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

/// Shared payload of the `machine_*` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    pub contest: String,
    pub challenge: String,
    pub status: String,
    #[serde(default)]
    pub machine_id: Option<i64>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub heartbeat_at: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Why an inbound frame was rejected
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotObject,
    #[error("frame has no string 'event' field")]
    MissingEvent,
    #[error("frame has a 'seq' that is not a non-negative integer: {0}")]
    InvalidSeq(Value),
}

/// A decoded real-time message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Raw event name, kept even when `event` is `Unknown`
    pub name: String,
    pub seq: Option<u64>,
    pub contest: Option<String>,
    pub event: Event,
    /// The full JSON object as received
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(FrameError::NotObject),
        }
    }

    pub fn from_map(payload: Map<String, Value>) -> Result<Self, FrameError> {
        let name = payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingEvent)?
            .to_string();
        let seq = match payload.get("seq") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_seq(value).ok_or_else(|| FrameError::InvalidSeq(value.clone()))?),
        };
        let contest = payload
            .get("contest")
            .and_then(Value::as_str)
            .map(str::to_string);

        let event = match serde_json::from_value::<Event>(Value::Object(payload.clone())) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(event = %name, error = %e, "Payload does not match known event shape");
                Event::Unknown
            }
        };

        Ok(Self {
            name,
            seq,
            contest,
            event,
            payload,
        })
    }

    /// Snapshot-class events carry a full replacement state
    pub fn is_snapshot(&self) -> bool {
        self.name.ends_with("_snapshot")
    }

    pub fn is_pong(&self) -> bool {
        self.name == "pong"
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Integral JSON numbers only; `3.0` is accepted as `3`
fn parse_seq(value: &Value) -> Option<u64> {
    if let Some(seq) = value.as_u64() {
        return Some(seq);
    }
    let seq = value.as_f64()?;
    if seq.is_finite() && seq >= 0.0 && seq.fract() == 0.0 && seq <= u64::MAX as f64 {
        Some(seq as u64)
    } else {
        None
    }
}
