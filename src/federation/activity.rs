//! Activity model and JSON codec
//!
//! Only Follow, Accept and Undo are interpreted. Every other `type` is
//! preserved as [`Activity::Unknown`] so callers can log and drop it.

use serde_json::{Map, Value, json};
use url::Url;

use crate::error::AppError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Discriminant of [`Activity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Follow,
    Accept,
    Undo,
    Unknown,
}

impl ActivityKind {
    fn from_type(kind: &str) -> Self {
        match kind {
            "Follow" => ActivityKind::Follow,
            "Accept" => ActivityKind::Accept,
            "Undo" => ActivityKind::Undo,
            _ => ActivityKind::Unknown,
        }
    }

    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Follow => "Follow",
            ActivityKind::Accept => "Accept",
            ActivityKind::Undo => "Undo",
            ActivityKind::Unknown => "Unknown",
        }
    }
}

/// What an activity's `object` refers to
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Absent,
    Uri(Url),
    /// An embedded Follow, Accept or Undo
    Activity(Box<Activity>),
    /// Anything else, kept verbatim
    Other(Value),
}

impl ObjectRef {
    /// `id` of the referenced object, whatever its form
    pub fn id(&self) -> Option<Url> {
        match self {
            ObjectRef::Absent => None,
            ObjectRef::Uri(uri) => Some(uri.clone()),
            ObjectRef::Activity(activity) => activity.id().cloned(),
            ObjectRef::Other(value) => value.get("id").and_then(parse_reference),
        }
    }

    fn from_json(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return ObjectRef::Absent;
        };

        match value {
            Value::Null => ObjectRef::Absent,
            Value::String(s) => match Url::parse(s) {
                Ok(uri) => ObjectRef::Uri(uri),
                Err(_) => ObjectRef::Other(value.clone()),
            },
            Value::Object(map) => {
                let embedded_kind = map
                    .get("type")
                    .and_then(type_name)
                    .map(ActivityKind::from_type);
                match embedded_kind {
                    Some(ActivityKind::Follow | ActivityKind::Accept | ActivityKind::Undo) => {
                        match Activity::from_json(value) {
                            Ok(activity) => ObjectRef::Activity(Box::new(activity)),
                            Err(_) => ObjectRef::Other(value.clone()),
                        }
                    }
                    _ => ObjectRef::Other(value.clone()),
                }
            }
            _ => ObjectRef::Other(value.clone()),
        }
    }

    fn to_json(&self) -> Option<Value> {
        match self {
            ObjectRef::Absent => None,
            ObjectRef::Uri(uri) => Some(Value::String(uri.to_string())),
            ObjectRef::Activity(activity) => Some(activity.to_json_inner()),
            ObjectRef::Other(value) => Some(value.clone()),
        }
    }
}

/// Fields shared by every activity variant
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFields {
    /// Absent only on activities built locally before an id is assigned
    pub id: Option<Url>,
    pub actor: Option<Url>,
    pub object: ObjectRef,
    pub to: Vec<Url>,
}

impl ActivityFields {
    pub fn new(id: Option<Url>, actor: Option<Url>, object: ObjectRef) -> Self {
        Self {
            id,
            actor,
            object,
            to: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Follow(ActivityFields),
    Accept(ActivityFields),
    Undo(ActivityFields),
    Unknown { kind: String, fields: ActivityFields },
}

/// `type` may be a string or, in JSON-LD compacted form, an array.
fn type_name(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Array(items) => items.iter().find_map(Value::as_str),
        _ => None,
    }
}

/// A reference is either a URI string or an object carrying an `id`.
fn parse_reference(value: &Value) -> Option<Url> {
    match value {
        Value::String(s) => Url::parse(s).ok(),
        Value::Object(map) => map.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok()),
        _ => None,
    }
}

fn parse_audience(value: Option<&Value>) -> Vec<Url> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(parse_reference).collect(),
        Some(value) => parse_reference(value).into_iter().collect(),
        None => Vec::new(),
    }
}

impl Activity {
    pub fn follow(id: Url, actor: Url, object: Url) -> Self {
        Activity::Follow(ActivityFields::new(
            Some(id),
            Some(actor),
            ObjectRef::Uri(object),
        ))
    }

    /// Accept `accepted`, addressed to its actor
    pub fn accept(id: Url, actor: Url, accepted: Activity) -> Self {
        let to = accepted.actor().cloned().into_iter().collect();
        Activity::Accept(ActivityFields {
            id: Some(id),
            actor: Some(actor),
            object: ObjectRef::Activity(Box::new(accepted)),
            to,
        })
    }

    pub fn undo(id: Url, actor: Url, undone: Activity) -> Self {
        Activity::Undo(ActivityFields::new(
            Some(id),
            Some(actor),
            ObjectRef::Activity(Box::new(undone)),
        ))
    }

    pub fn kind(&self) -> ActivityKind {
        match self {
            Activity::Follow(_) => ActivityKind::Follow,
            Activity::Accept(_) => ActivityKind::Accept,
            Activity::Undo(_) => ActivityKind::Undo,
            Activity::Unknown { .. } => ActivityKind::Unknown,
        }
    }

    /// The literal `type` value
    pub fn type_name(&self) -> &str {
        match self {
            Activity::Unknown { kind, .. } => kind,
            known => known.kind().as_str(),
        }
    }

    pub fn fields(&self) -> &ActivityFields {
        match self {
            Activity::Follow(fields)
            | Activity::Accept(fields)
            | Activity::Undo(fields)
            | Activity::Unknown { fields, .. } => fields,
        }
    }

    pub fn id(&self) -> Option<&Url> {
        self.fields().id.as_ref()
    }

    pub fn actor(&self) -> Option<&Url> {
        self.fields().actor.as_ref()
    }

    pub fn object(&self) -> &ObjectRef {
        &self.fields().object
    }

    pub fn object_id(&self) -> Option<Url> {
        self.object().id()
    }

    /// Decode an incoming activity.
    ///
    /// Fails only if `value` is not an object or carries no `type`; missing
    /// or malformed `id`, `actor` and `object` come back as `None`/`Absent`
    /// for the caller to judge.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let map = value
            .as_object()
            .ok_or_else(|| AppError::Validation("Activity must be a JSON object".to_string()))?;

        let kind = map
            .get("type")
            .and_then(type_name)
            .ok_or_else(|| AppError::Validation("Activity has no type".to_string()))?;

        let fields = ActivityFields {
            id: map.get("id").and_then(Value::as_str).and_then(|s| Url::parse(s).ok()),
            actor: map.get("actor").and_then(parse_reference),
            object: ObjectRef::from_json(map.get("object")),
            to: parse_audience(map.get("to")),
        };

        Ok(match ActivityKind::from_type(kind) {
            ActivityKind::Follow => Activity::Follow(fields),
            ActivityKind::Accept => Activity::Accept(fields),
            ActivityKind::Undo => Activity::Undo(fields),
            ActivityKind::Unknown => Activity::Unknown {
                kind: kind.to_string(),
                fields,
            },
        })
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Activity is not valid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    /// Encode as a top-level JSON-LD document
    pub fn to_json(&self) -> Value {
        let mut value = self.to_json_inner();
        if let Value::Object(map) = &mut value {
            map.insert("@context".to_string(), json!(ACTIVITYSTREAMS_CONTEXT));
        }
        value
    }

    fn to_json_inner(&self) -> Value {
        let fields = self.fields();
        let mut map = Map::new();
        map.insert("type".to_string(), json!(self.type_name()));
        if let Some(id) = &fields.id {
            map.insert("id".to_string(), json!(id.as_str()));
        }
        if let Some(actor) = &fields.actor {
            map.insert("actor".to_string(), json!(actor.as_str()));
        }
        if let Some(object) = fields.object.to_json() {
            map.insert("object".to_string(), object);
        }
        if !fields.to.is_empty() {
            let to: Vec<&str> = fields.to.iter().map(Url::as_str).collect();
            map.insert("to".to_string(), json!(to));
        }
        Value::Object(map)
    }
}
