//! Junction between an event and the relay it was seen on.

use crate::error::{BigBrotrError, Result};
use crate::models::event::Event;
use crate::models::relay::Relay;

/// One observation of an event on a relay at a point in time.
///
/// Carries the full [`Event`] and [`Relay`] so the cascade insert can
/// create the parent rows atomically when they are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRelay {
    pub event: Event,
    pub relay: Relay,
    pub seen_at: i64,
}

impl EventRelay {
    pub fn new(event: Event, relay: Relay, seen_at: i64) -> Result<Self> {
        if seen_at < 0 {
            return Err(BigBrotrError::ModelValidation(
                "seen_at must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            event,
            relay,
            seen_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{EventBuilder, Keys};

    fn sample_event() -> Event {
        let keys = Keys::generate();
        let inner = EventBuilder::text_note("junction")
            .sign_with_keys(&keys)
            .unwrap();
        Event::new(inner).unwrap()
    }

    #[test]
    fn test_new_accepts_valid_timestamp() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let er = EventRelay::new(sample_event(), relay.clone(), 1_700_000_000).unwrap();
        assert_eq!(er.relay.url, relay.url);
        assert_eq!(er.seen_at, 1_700_000_000);
    }

    #[test]
    fn test_negative_seen_at_rejected() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let err = EventRelay::new(sample_event(), relay, -1).unwrap_err();
        assert!(matches!(err, BigBrotrError::ModelValidation(_)));
    }
}
