// ── Topic scheme ──
//
// Pure mapping between (instance, device, channel) and topic strings.
// Identifiers are validated once, at construction, so every topic built
// from them is well-formed: no leading/trailing separator, no empty
// segment, no wildcard characters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Version segment inserted after the base prefix.
pub const API_VERSION: &str = "v1";

const SEPARATOR: char = '/';
const SINGLE_LEVEL: char = '+';
const MULTI_LEVEL: char = '#';

// ── Validation ──────────────────────────────────────────────────────

fn validate_segment(kind: &str, raw: &str) -> Result<(), Error> {
    if raw.is_empty() {
        return Err(Error::invalid_topic(raw, format!("{kind} must not be empty")));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| matches!(*c, SEPARATOR | SINGLE_LEVEL | MULTI_LEVEL | '\0'))
    {
        return Err(Error::invalid_topic(
            raw,
            format!("{kind} must not contain {c:?}"),
        ));
    }
    Ok(())
}

fn validate_path(kind: &str, raw: &str) -> Result<(), Error> {
    if raw.is_empty() {
        return Err(Error::invalid_topic(raw, format!("{kind} must not be empty")));
    }
    if raw.starts_with(SEPARATOR) || raw.ends_with(SEPARATOR) {
        return Err(Error::invalid_topic(
            raw,
            format!("{kind} must not begin or end with '/'"),
        ));
    }
    for segment in raw.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(Error::invalid_topic(
                raw,
                format!("{kind} must not contain consecutive separators"),
            ));
        }
        validate_segment(kind, segment)?;
    }
    Ok(())
}

/// Validate a subscription filter: `+` must fill a whole level and `#`
/// may only appear as the final level.
pub(crate) fn validate_filter(raw: &str) -> Result<(), Error> {
    if raw.is_empty() {
        return Err(Error::invalid_topic(raw, "filter must not be empty"));
    }
    let levels: Vec<&str> = raw.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (idx, level) in levels.iter().enumerate() {
        if level.contains(MULTI_LEVEL) && (*level != "#" || idx != last) {
            return Err(Error::invalid_topic(raw, "'#' must be the last, whole level"));
        }
        if level.contains(SINGLE_LEVEL) && *level != "+" {
            return Err(Error::invalid_topic(raw, "'+' must occupy a whole level"));
        }
    }
    Ok(())
}

/// MQTT filter matching (`+` single level, `#` remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ── Identifier newtypes ─────────────────────────────────────────────

macro_rules! topic_segment_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
                let raw = raw.into();
                validate_segment($kind, &raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

topic_segment_id!(
    /// Identity of one running bridge process.
    InstanceId,
    "instance id"
);

topic_segment_id!(
    /// Identity of one device, unique within its instance.
    DeviceId,
    "device id"
);

/// Namespaced sub-path a parasitic extension publishes under
/// (`.../devices/D/ext/<path>`). May span several levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtensionPath(String);

impl ExtensionPath {
    pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        validate_path("extension path", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ExtensionPath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ExtensionPath> for String {
    fn from(p: ExtensionPath) -> Self {
        p.0
    }
}

// ── TopicMatch ──────────────────────────────────────────────────────

/// Result of inverting a topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMatch {
    State {
        instance: InstanceId,
        device: DeviceId,
    },
    Command {
        instance: InstanceId,
        device: DeviceId,
    },
    Response {
        instance: InstanceId,
        device: DeviceId,
    },
    Extension {
        instance: InstanceId,
        device: DeviceId,
        path: String,
    },
    Availability {
        instance: InstanceId,
    },
    NotMatched,
}

// ── TopicScheme ─────────────────────────────────────────────────────

/// Topic layout rooted at a base prefix:
///
/// ```text
/// B/v1/instances/I/status
/// B/v1/instances/I/devices/D/state
/// B/v1/instances/I/devices/D/cmd
/// B/v1/instances/I/devices/D/cmd/response
/// B/v1/instances/I/devices/D/ext/<path>
/// ```
///
/// An empty base drops the prefix (`v1/instances/...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
}

impl TopicScheme {
    pub fn new(base: impl AsRef<str>) -> Result<Self, Error> {
        let base = base.as_ref();
        let root = if base.is_empty() {
            API_VERSION.to_owned()
        } else {
            validate_path("base topic", base)?;
            format!("{base}{SEPARATOR}{API_VERSION}")
        };
        Ok(Self { root })
    }

    /// `B/v1`, the prefix shared by every topic of this scheme.
    pub fn root(&self) -> &str {
        &self.root
    }

    fn device_prefix(&self, instance: &InstanceId, device: &DeviceId) -> String {
        format!("{}/instances/{instance}/devices/{device}", self.root)
    }

    pub fn state_topic(&self, instance: &InstanceId, device: &DeviceId) -> String {
        format!("{}/state", self.device_prefix(instance, device))
    }

    pub fn command_topic(&self, instance: &InstanceId, device: &DeviceId) -> String {
        format!("{}/cmd", self.device_prefix(instance, device))
    }

    pub fn response_topic(&self, instance: &InstanceId, device: &DeviceId) -> String {
        format!("{}/cmd/response", self.device_prefix(instance, device))
    }

    pub fn extension_topic(
        &self,
        instance: &InstanceId,
        device: &DeviceId,
        path: &ExtensionPath,
    ) -> String {
        format!("{}/ext/{path}", self.device_prefix(instance, device))
    }

    pub fn availability_topic(&self, instance: &InstanceId) -> String {
        format!("{}/instances/{instance}/status", self.root)
    }

    /// Subscription filter covering the command topic of every device of
    /// `instance`.
    pub fn command_filter(&self, instance: &InstanceId) -> String {
        format!("{}/instances/{instance}/devices/+/cmd", self.root)
    }

    /// Invert any topic built by this scheme. Foreign or malformed topics
    /// yield [`TopicMatch::NotMatched`].
    pub fn parse(&self, topic: &str) -> TopicMatch {
        let Some(rest) = topic
            .strip_prefix(self.root.as_str())
            .and_then(|r| r.strip_prefix(SEPARATOR))
        else {
            return TopicMatch::NotMatched;
        };

        let levels: Vec<&str> = rest.split(SEPARATOR).collect();
        let parsed = match levels.as_slice() {
            ["instances", i, "status"] => InstanceId::new(*i)
                .ok()
                .map(|instance| TopicMatch::Availability { instance }),
            ["instances", i, "devices", d, tail @ ..] => {
                let (Ok(instance), Ok(device)) = (InstanceId::new(*i), DeviceId::new(*d)) else {
                    return TopicMatch::NotMatched;
                };
                match tail {
                    ["state"] => Some(TopicMatch::State { instance, device }),
                    ["cmd"] => Some(TopicMatch::Command { instance, device }),
                    ["cmd", "response"] => Some(TopicMatch::Response { instance, device }),
                    ["ext", path @ ..] if !path.is_empty() => {
                        let path = path.join("/");
                        ExtensionPath::new(path.clone()).ok().map(|_| TopicMatch::Extension {
                            instance,
                            device,
                            path,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        parsed.unwrap_or(TopicMatch::NotMatched)
    }
}
