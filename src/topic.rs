//! # Topic Codec
//!
//! Pure functions for building and parsing the MQTT topics the bridge speaks.
//!
//! A topic is a raw `prefix` followed by the levels of a [`TopicTemplate`]
//! joined with `/`. Exactly one level kind is not literal: the
//! [`Placeholder::MacAddress`] level, which carries the [`DeviceIdentity`]
//! of the addressed actuator.
//!
//! ```text
//! homeassistant/switchbot/aa:bb:cc:dd:ee:ff/set-position
//! └─ prefix ───┘└─ literal ┘└─ placeholder ─┘└─ literal ─┘
//! ```
//!
//! The codec never validates MAC syntax while joining; callers validate
//! separately with [`mac_address_valid`] or [`DeviceIdentity::parse`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Level value substituted for the MAC address when subscribing.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Named placeholder levels of a [`TopicTemplate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    MacAddress,
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placeholder::MacAddress => f.write_str("{mac}"),
        }
    }
}

/// One segment of a topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicLevel {
    Literal(&'static str),
    Placeholder(Placeholder),
}

impl TopicLevel {
    pub const MAC_ADDRESS: TopicLevel = TopicLevel::Placeholder(Placeholder::MacAddress);
}

/// Static shape of one topic class. Templates are constants of each actor type.
pub type TopicTemplate = &'static [TopicLevel];

/// `switchbot/{mac}/state`, retained state of any actor.
pub const STATE_TOPIC: TopicTemplate = &[
    TopicLevel::Literal("switchbot"),
    TopicLevel::MAC_ADDRESS,
    TopicLevel::Literal("state"),
];

/// `switchbot/{mac}/battery-percentage`
pub const BATTERY_PERCENTAGE_TOPIC: TopicTemplate = &[
    TopicLevel::Literal("switchbot"),
    TopicLevel::MAC_ADDRESS,
    TopicLevel::Literal("battery-percentage"),
];

/// `switchbot/{mac}/request-device-info`
pub const REQUEST_DEVICE_INFO_TOPIC: TopicTemplate = &[
    TopicLevel::Literal("switchbot"),
    TopicLevel::MAC_ADDRESS,
    TopicLevel::Literal("request-device-info"),
];

/// Renders a template for log and error messages, e.g. `switchbot/{mac}/state`.
pub fn describe_template(template: TopicTemplate) -> String {
    template
        .iter()
        .map(|level| match level {
            TopicLevel::Literal(literal) => (*literal).to_string(),
            TopicLevel::Placeholder(placeholder) => placeholder.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// An inbound topic did not have the expected shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unexpected topic {topic:?} (expected {prefix:?} followed by {template})")]
pub struct TopicMismatch {
    pub topic: String,
    pub prefix: String,
    pub template: String,
}

/// Builds a topic by substituting `mac_address` for every placeholder level.
///
/// Pass [`SINGLE_LEVEL_WILDCARD`] to obtain the subscription filter.
pub fn join_topic(prefix: &str, template: TopicTemplate, mac_address: &str) -> String {
    let levels: Vec<&str> = template
        .iter()
        .map(|level| match level {
            TopicLevel::Literal(literal) => *literal,
            TopicLevel::Placeholder(Placeholder::MacAddress) => mac_address,
        })
        .collect();
    format!("{prefix}{}", levels.join("/"))
}

/// Matches `topic` against `prefix` + `template` level by level.
///
/// Literal levels must be equal; a placeholder level matches any single
/// non-empty level and its value is captured.
pub fn parse_topic(
    topic: &str,
    prefix: &str,
    template: TopicTemplate,
) -> Result<HashMap<Placeholder, String>, TopicMismatch> {
    let mismatch = || TopicMismatch {
        topic: topic.to_string(),
        prefix: prefix.to_string(),
        template: describe_template(template),
    };

    let rest = topic.strip_prefix(prefix).ok_or_else(mismatch)?;
    let levels: Vec<&str> = rest.split('/').collect();
    if levels.len() != template.len() {
        return Err(mismatch());
    }

    let mut values = HashMap::new();
    for (expected, actual) in template.iter().zip(levels) {
        match expected {
            TopicLevel::Literal(literal) if *literal == actual => {}
            TopicLevel::Literal(_) => return Err(mismatch()),
            TopicLevel::Placeholder(_) if actual.is_empty() => return Err(mismatch()),
            TopicLevel::Placeholder(placeholder) => {
                values.insert(*placeholder, actual.to_string());
            }
        }
    }
    Ok(values)
}

/// MQTT filter matching with `+` (one level) and a trailing `#` (any remainder).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == SINGLE_LEVEL_WILDCARD => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

static MAC_ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:[0-9a-f]{2}(?::[0-9a-f]{2}){5}|[0-9a-f]{12})$")
        .unwrap_or_else(|err| unreachable!("static MAC pattern: {err}"))
});

/// Canonical MAC grammar: 12 hex digits, either bare or colon-separated
/// every two digits. Case-insensitive.
pub fn mac_address_valid(candidate: &str) -> bool {
    MAC_ADDRESS_PATTERN.is_match(candidate)
}

/// A candidate address failed [`mac_address_valid`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid mac address {0:?}")]
pub struct InvalidDeviceIdentity(pub String);

/// MAC address of one physical actuator.
///
/// Keeps the spelling received on the wire (used to build reply topics, so
/// state lands next to the command topic the client used) and a canonical
/// lowercase colon-separated form used for lookups and locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    address: String,
    canonical: String,
}

impl DeviceIdentity {
    pub fn parse(candidate: &str) -> Result<Self, InvalidDeviceIdentity> {
        if !mac_address_valid(candidate) {
            return Err(InvalidDeviceIdentity(candidate.to_string()));
        }
        let digits: Vec<char> = candidate
            .chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let canonical = digits
            .chunks(2)
            .map(|pair| pair.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self {
            address: candidate.to_string(),
            canonical,
        })
    }

    /// The address as it appeared in the topic.
    pub fn as_str(&self) -> &str {
        &self.address
    }

    /// Lowercase, colon-separated form, e.g. `aa:bb:cc:dd:ee:ff`.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl FromStr for DeviceIdentity {
    type Err = InvalidDeviceIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: TopicTemplate = STATE_TOPIC;

    #[test]
    fn join_substitutes_mac_address() {
        assert_eq!(
            join_topic("homeassistant/", STATE, "aa:bb:cc:dd:ee:ff"),
            "homeassistant/switchbot/aa:bb:cc:dd:ee:ff/state"
        );
        assert_eq!(join_topic("", STATE, SINGLE_LEVEL_WILDCARD), "switchbot/+/state");
    }

    #[test]
    fn parse_inverts_join() {
        for prefix in ["", "homeassistant/", "home/"] {
            for mac in ["aa:bb:cc:dd:ee:ff", "AABBCCDDEEFF", "01:23:45:67:89:AB"] {
                let topic = join_topic(prefix, STATE, mac);
                let values = parse_topic(&topic, prefix, STATE).unwrap();
                assert_eq!(values.len(), 1);
                assert_eq!(values[&Placeholder::MacAddress], mac);
            }
        }
    }

    #[test]
    fn parse_rejects_wrong_literal() {
        let err = parse_topic("switchbot/aa:bb:cc:dd:ee:ff/status", "", STATE).unwrap_err();
        assert_eq!(err.topic, "switchbot/aa:bb:cc:dd:ee:ff/status");
        assert_eq!(err.template, "switchbot/{mac}/state");
    }

    #[test]
    fn parse_rejects_wrong_level_count() {
        assert!(parse_topic("switchbot/aa:bb:cc:dd:ee:ff", "", STATE).is_err());
        assert!(parse_topic("switchbot/aa:bb:cc:dd:ee:ff/state/extra", "", STATE).is_err());
        assert!(parse_topic("", "", STATE).is_err());
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        let topic = "homeassistant/switchbot/aa:bb:cc:dd:ee:ff/state";
        assert!(parse_topic(topic, "home/", STATE).is_err());
        assert!(parse_topic(topic, "", STATE).is_err());
    }

    #[test]
    fn parse_rejects_empty_placeholder() {
        assert!(parse_topic("switchbot//state", "", STATE).is_err());
    }

    #[test]
    fn mac_grammar() {
        assert!(mac_address_valid("aa:bb:cc:dd:ee:ff"));
        assert!(mac_address_valid("AABBCCDDEEFF"));
        assert!(mac_address_valid("aA:Bb:00:11:22:33"));

        assert!(!mac_address_valid("aa:bb:cc"));
        assert!(!mac_address_valid("zz:bb:cc:dd:ee:ff"));
        assert!(!mac_address_valid("aa:bbcc:dd:ee:ff"));
        assert!(!mac_address_valid("aa-bb-cc-dd-ee-ff"));
        assert!(!mac_address_valid("aa:bb:cc:dd:ee:ff:00"));
        assert!(!mac_address_valid(""));
        assert!(!mac_address_valid("+"));
    }

    #[test]
    fn identity_normalizes() {
        let identity = DeviceIdentity::parse("AABBCCDDEEFF").unwrap();
        assert_eq!(identity.as_str(), "AABBCCDDEEFF");
        assert_eq!(identity.canonical(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(
            "AA:bb:CC:dd:EE:ff".parse::<DeviceIdentity>().unwrap().canonical(),
            "aa:bb:cc:dd:ee:ff"
        );
        assert!(DeviceIdentity::parse("aa:bb:cc").is_err());
    }

    #[test]
    fn filters() {
        assert!(filter_matches("switchbot/+/press", "switchbot/aa/press"));
        assert!(!filter_matches("switchbot/+/press", "switchbot/aa/state"));
        assert!(!filter_matches("switchbot/+/press", "switchbot/aa/press/x"));
        assert!(!filter_matches("switchbot/+/press", "switchbot/press"));
        assert!(filter_matches("switchbot/#", "switchbot/aa/press"));
        assert!(filter_matches("homeassistant/switchbot/+/state", "homeassistant/switchbot/aa/state"));
    }
}
