use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const PLACEHOLDER_PREFIX: &str = "local-";

/// Identifier of a job: assigned by the server, or a client placeholder for a
/// job created offline that has not been replayed yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobId {
  Server(i64),
  Placeholder(Uuid),
}

impl JobId {
  pub fn new_placeholder() -> Self {
    Self::Placeholder(Uuid::new_v4())
  }

  pub fn is_placeholder(&self) -> bool {
    matches!(self, Self::Placeholder(_))
  }
}

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Server(id) => write!(f, "{}", id),
      Self::Placeholder(uuid) => write!(f, "{}{}", PLACEHOLDER_PREFIX, uuid),
    }
  }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid job id '{0}'")]
pub struct ParseJobIdError(String);

impl FromStr for JobId {
  type Err = ParseJobIdError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(rest) = s.strip_prefix(PLACEHOLDER_PREFIX) {
      return Uuid::parse_str(rest)
        .map(Self::Placeholder)
        .map_err(|_| ParseJobIdError(s.to_string()));
    }
    s.parse::<i64>()
      .map(Self::Server)
      .map_err(|_| ParseJobIdError(s.to_string()))
  }
}

// Server ids travel as JSON numbers, placeholders as strings.
impl Serialize for JobId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Self::Server(id) => serializer.serialize_i64(*id),
      Self::Placeholder(_) => serializer.collect_str(self),
    }
  }
}

impl<'de> Deserialize<'de> for JobId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Number(i64),
      Text(String),
    }

    match Raw::deserialize(deserializer)? {
      Raw::Number(id) => Ok(Self::Server(id)),
      Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
  }
}

/// A job document. Only `id` is interpreted; everything else is carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: JobId,
  /// Set on optimistic writes until the server confirms them
  #[serde(rename = "_unconfirmed", default, skip_serializing_if = "is_false")]
  pub unconfirmed: bool,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
  !*b
}

impl Job {
  /// Build the speculative local copy of a job created while offline.
  pub fn optimistic(id: JobId, payload: &Value) -> Self {
    let mut job = Self {
      id,
      unconfirmed: true,
      fields: Map::new(),
    };
    job.apply_patch(payload);
    job
  }

  /// Merge the fields of an update payload into this job and mark it unconfirmed.
  pub fn apply_patch(&mut self, payload: &Value) {
    if let Value::Object(patch) = payload {
      for (key, value) in patch {
        if key == "id" || key == "_unconfirmed" {
          continue;
        }
        self.fields.insert(key.clone(), value.clone());
      }
    }
    self.unconfirmed = true;
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  /// Whether `scheduled_at` falls on the given calendar day.
  pub fn is_scheduled_on(&self, date: NaiveDate) -> bool {
    self
      .field("scheduled_at")
      .and_then(Value::as_str)
      .and_then(|s| s.get(..10))
      .map(|day| day == date.format("%Y-%m-%d").to_string())
      .unwrap_or(false)
  }
}

/// Dashboard counters for the signed-in worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stats(pub Map<String, Value>);

/// Profile of the signed-in user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(pub Map<String, Value>);
