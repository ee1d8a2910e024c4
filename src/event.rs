//! ESL events: inbound notifications with lazily parsed bodies, and
//! outbound events that can be sent back into FreeSWITCH.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::*;
use crate::headers::Headers;
use crate::protocol::{find_blank_line, RawPacket};

/// The name and optional subclass of an event. A non-empty subclass marks a
/// CUSTOM event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EventName {
    pub name: String,
    pub subclass: String,
}

impl EventName {
    /// Key for a regular (non-CUSTOM) event.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subclass: String::new(),
        }
    }

    /// Key for a CUSTOM event with the given subclass.
    pub fn custom(subclass: impl Into<String>) -> Self {
        Self {
            name: EVENT_CUSTOM.to_string(),
            subclass: subclass.into(),
        }
    }

    /// `true` if this names a custom event (and therefore has a subclass).
    pub fn is_custom(&self) -> bool {
        !self.subclass.is_empty()
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_custom() {
            write!(f, "{} {}", self.name, self.subclass)
        } else {
            f.write_str(&self.name)
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EventData {
    headers: Headers,
    body: String,
}

/// An event raised by FreeSWITCH, or one under construction for
/// [`send_event`](crate::EslClient::send_event).
///
/// Inbound events defer parsing their raw body until a header or the body
/// is first accessed; the parse runs at most once. If the body is
/// malformed, the event behaves as having a single synthetic `Event-Name`
/// header carrying the parse error text, so accessors stay total.
#[derive(Debug)]
pub struct EslEvent {
    raw: Option<RawPacket>,
    parsed: OnceLock<EventData>,
}

impl EslEvent {
    /// Start a new outbound event named `name`.
    pub fn new(name: &str) -> Self {
        let mut headers = Headers::new();
        headers.add(HEADER_EVENT_NAME, name);
        Self {
            raw: None,
            parsed: OnceLock::from(EventData {
                headers,
                body: String::new(),
            }),
        }
    }

    /// Start a new outbound CUSTOM event with the given subclass.
    pub fn custom(subclass: &str) -> Self {
        let mut event = Self::new(EVENT_CUSTOM);
        event.set(HEADER_EVENT_SUBCLASS, subclass);
        event
    }

    /// Load an event from raw packet text, the format produced by this
    /// type's `Display` implementation.
    pub fn load(raw: &str) -> Self {
        Self::from_packet(RawPacket {
            headers: Headers::new(),
            body: raw.to_string(),
        })
    }

    pub(crate) fn from_packet(raw: RawPacket) -> Self {
        Self {
            raw: Some(raw),
            parsed: OnceLock::new(),
        }
    }

    fn data(&self) -> &EventData {
        self.parsed.get_or_init(|| {
            let body = self.raw.as_ref().map(|r| r.body.as_str()).unwrap_or("");
            parse_event_body(body)
        })
    }

    fn data_mut(&mut self) -> &mut EventData {
        let _ = self.data();
        self.parsed.get_mut().expect("event data initialized")
    }

    /// Value of a named header from the event body, or the empty string
    /// when absent.
    pub fn get(&self, name: &str) -> &str {
        self.data().headers.get(name)
    }

    /// The event's name and subclass.
    pub fn name(&self) -> EventName {
        EventName {
            name: self.get(HEADER_EVENT_NAME).to_string(),
            subclass: self.get(HEADER_EVENT_SUBCLASS).to_string(),
        }
    }

    /// The event's body, excluding its headers.
    pub fn body(&self) -> &str {
        &self.data().body
    }

    /// The moment the event was raised, from the `Event-Date-Timestamp`
    /// header (microseconds since the epoch). `None` when the header is
    /// missing or malformed.
    pub fn timestamp(&self) -> Option<SystemTime> {
        let micros = self.get(HEADER_EVENT_TIMESTAMP).parse::<u64>().ok()?;
        Some(UNIX_EPOCH + Duration::from_micros(micros))
    }

    /// The event's position in the server's emission order, from the
    /// `Event-Sequence` header.
    pub fn sequence(&self) -> Option<u64> {
        self.get(HEADER_EVENT_SEQUENCE).parse().ok()
    }

    /// Replace all values of the named header. Setting an empty value is a
    /// no-op.
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.data_mut().headers.set(name, value);
        }
        self
    }

    /// Set the event body, updating `Content-Length` to match.
    pub fn set_body(&mut self, body: &str) -> &mut Self {
        let data = self.data_mut();
        data.headers.set(HEADER_CONTENT_LENGTH, body.len().to_string());
        data.body = body.to_string();
        self
    }

    /// Remove every value of the named header.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.data_mut().headers.remove(name);
        self
    }
}

impl Clone for EslEvent {
    fn clone(&self) -> Self {
        let parsed = OnceLock::new();
        if let Some(data) = self.parsed.get() {
            let _ = parsed.set(data.clone());
        }
        Self {
            raw: self.raw.clone(),
            parsed,
        }
    }
}

/// Wire form accepted by `sendevent`: the percent-escaped header block, a
/// blank line, then the body. Complements [`EslEvent::load`].
impl fmt::Display for EslEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        write!(f, "{}\n{}", data.headers.to_escaped_string(), data.body)
    }
}

/// An event body is itself a MIME-style header block (values
/// percent-escaped) optionally followed by `Content-Length` bytes of
/// sub-body.
fn parse_event_body(body: &str) -> EventData {
    let (block, rest) = match find_blank_line(body.as_bytes()) {
        Some((block_len, consumed)) => (&body[..block_len], &body[consumed..]),
        None => (body, ""),
    };
    match Headers::parse(block, true) {
        Ok(headers) => {
            let body = match headers.get(HEADER_CONTENT_LENGTH).parse::<usize>() {
                Ok(length) if length > 0 => {
                    let take = length.min(rest.len());
                    String::from_utf8_lossy(&rest.as_bytes()[..take]).into_owned()
                }
                _ => String::new(),
            };
            EventData { headers, body }
        }
        Err(err) => {
            let mut headers = Headers::new();
            headers.add(HEADER_EVENT_NAME, err.to_string());
            EventData {
                headers,
                body: String::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> EslEvent {
        EslEvent::load(
            "Event-Name: HEARTBEAT\nEvent-Date-Timestamp: 1700000000000000\nEvent-Sequence: 79878\n",
        )
    }

    #[test]
    fn lazy_parse_is_idempotent() {
        let event = heartbeat();
        assert_eq!(event.get("Event-Name"), "HEARTBEAT");
        assert_eq!(event.get("Event-Name"), "HEARTBEAT");
        assert_eq!(event.name(), EventName::plain("HEARTBEAT"));
    }

    #[test]
    fn timestamp_from_microseconds() {
        let event = heartbeat();
        assert_eq!(
            event.timestamp(),
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
        assert_eq!(event.sequence(), Some(79878));
    }

    #[test]
    fn timestamp_absent_or_malformed() {
        let event = EslEvent::load("Event-Name: HEARTBEAT\n");
        assert_eq!(event.timestamp(), None);
        let event = EslEvent::load("Event-Date-Timestamp: yesterday\n");
        assert_eq!(event.timestamp(), None);
    }

    #[test]
    fn values_are_unescaped() {
        let event = EslEvent::load("Event-Name: HEARTBEAT\nEvent-Info: System%20Ready\n");
        assert_eq!(event.get("Event-Info"), "System Ready");
    }

    #[test]
    fn sub_body_from_content_length() {
        let event = EslEvent::load(
            "Event-Name: BACKGROUND_JOB\nContent-Length: 3\n\nok\nEXTRA",
        );
        assert_eq!(event.body(), "ok\n");
        assert_eq!(event.get("Event-Name"), "BACKGROUND_JOB");
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let event = EslEvent::load("Event-Name: HEARTBEAT\n\nleftovers");
        assert_eq!(event.body(), "");
    }

    #[test]
    fn malformed_body_yields_synthetic_name() {
        let event = EslEvent::load("this is not a header block");
        let name = event.name();
        assert!(name.name.contains("malformed header line"));
        assert_eq!(event.body(), "");
        assert_eq!(event.get("anything"), "");
    }

    #[test]
    fn custom_event_name() {
        let event =
            EslEvent::load("Event-Name: CUSTOM\nEvent-Subclass: sofia%3A%3Aregister\n");
        let name = event.name();
        assert!(name.is_custom());
        assert_eq!(name.subclass, "sofia::register");
        assert_eq!(name.to_string(), "CUSTOM sofia::register");
    }

    #[test]
    fn outbound_construction() {
        let mut event = EslEvent::new("NOTIFY");
        event.set("profile", "internal").set("ping", "salutations");
        assert_eq!(event.get("Event-Name"), "NOTIFY");
        assert_eq!(event.get("profile"), "internal");

        event.set("profile", "external");
        assert_eq!(event.get("profile"), "external");

        // Empty values are a no-op rather than a delete.
        event.set("profile", "");
        assert_eq!(event.get("profile"), "external");
    }

    #[test]
    fn outbound_custom_event() {
        let event = EslEvent::custom("conference::maintenance");
        assert_eq!(
            event.name(),
            EventName::custom("conference::maintenance")
        );
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut event = EslEvent::new("SEND_MESSAGE");
        event.set_body("here's a payload");
        assert_eq!(event.get("Content-Length"), "16");
        assert_eq!(event.body(), "here's a payload");
    }

    #[test]
    fn wire_form_escapes_values() {
        let mut event = EslEvent::new("SEND_MESSAGE");
        event.set("to", "user one");
        event.set_body("hi");
        assert_eq!(
            event.to_string(),
            "Event-Name: SEND_MESSAGE\nto: user%20one\nContent-Length: 2\n\nhi"
        );
    }

    #[test]
    fn wire_form_round_trips_through_load() {
        let mut event = EslEvent::new("SEND_MESSAGE");
        event.set("to", "user one");
        event.set_body("hi");
        let reloaded = EslEvent::load(&event.to_string());
        assert_eq!(reloaded.get("to"), "user one");
        assert_eq!(reloaded.body(), "hi");
    }
}
