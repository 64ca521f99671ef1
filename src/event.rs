//! Event synthesis: one [`SequenceIndex`] in, one [`Event`] out.
//!
//! The synthesizer owns no counters and reads no ambient state. The wall clock
//! and the identifier source are handed to it as a [`Clock`] and an
//! [`IdSource`], which is what lets tests pin both and compare exact payloads.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::pacer::SequenceIndex;

/// Tag carried by every synthetic event.
pub const EVENT_NAME: &str = "myEvent";

/// The execution environment cannot produce timestamps or identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("wall clock unavailable: {0}")]
    Clock(String),
    #[error("random source unavailable: {0}")]
    Randomness(String),
}

/// A synthetic event. Field order here is the field order on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    #[serde(serialize_with = "serialize_instant")]
    pub produced_at: DateTime<Utc>,
    pub actor_id: Uuid,
    pub event_name: &'static str,
    pub data: EventData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    /// The originating sequence index.
    pub my_int: u64,
}

/// ISO-8601 instant, `Z` suffixed, with the shortest sub-second precision
/// that represents the value.
fn serialize_instant<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Result<DateTime<Utc>, SynthesisError>;
}

pub trait IdSource: Send + Sync {
    fn next_id(&self) -> Result<Uuid, SynthesisError>;
}

/// The host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<DateTime<Utc>, SynthesisError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SynthesisError::Clock(e.to_string()))?;
        let secs = i64::try_from(since_epoch.as_secs())
            .map_err(|e| SynthesisError::Clock(e.to_string()))?;
        DateTime::from_timestamp(secs, since_epoch.subsec_nanos())
            .ok_or_else(|| SynthesisError::Clock(format!("{secs}s is out of range")))
    }
}

/// Version 4 UUIDs drawn from the operating system's random source.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> Result<Uuid, SynthesisError> {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes).map_err(|e| SynthesisError::Randomness(e.to_string()))?;
        Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// Turns sequence indices into events.
#[derive(Debug, Clone, Default)]
pub struct Synthesizer<C = SystemClock, I = RandomIds> {
    clock: C,
    ids: I,
}

impl Synthesizer {
    /// Wall clock and OS randomness.
    pub fn system() -> Self {
        Self::default()
    }
}

impl<C: Clock, I: IdSource> Synthesizer<C, I> {
    pub fn new(clock: C, ids: I) -> Self {
        Self { clock, ids }
    }

    pub fn synthesize(&self, index: SequenceIndex) -> Result<Event, SynthesisError> {
        Ok(Event {
            event_id: self.ids.next_id()?,
            produced_at: self.clock.now()?,
            actor_id: self.ids.next_id()?,
            event_name: EVENT_NAME,
            data: EventData {
                my_int: index.get(),
            },
        })
    }

    /// Synthesizes and discards one event so a broken clock or random source
    /// is reported before the first emission.
    pub fn probe(&self) -> Result<(), SynthesisError> {
        self.synthesize(SequenceIndex::ZERO).map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// Always reports the same instant.
    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> Result<DateTime<Utc>, SynthesisError> {
            Ok(self.0)
        }
    }

    /// Hands out `00000000-0000-0000-0000-000000000001`, `...02` and so on.
    #[derive(Default)]
    pub struct SequentialIds(AtomicU64);

    impl IdSource for SequentialIds {
        fn next_id(&self) -> Result<Uuid, SynthesisError> {
            let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(Uuid::from_u64_pair(0, n))
        }
    }

    pub struct BrokenIds;

    /// Hands out `n` random ids, then reports the source as gone.
    pub struct ExhaustibleIds(AtomicU64);

    impl ExhaustibleIds {
        pub fn new(n: u64) -> Self {
            Self(AtomicU64::new(n))
        }
    }

    impl IdSource for ExhaustibleIds {
        fn next_id(&self) -> Result<Uuid, SynthesisError> {
            self.0
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| SynthesisError::Randomness("entropy budget spent".into()))?;
            RandomIds.next_id()
        }
    }

    impl IdSource for BrokenIds {
        fn next_id(&self) -> Result<Uuid, SynthesisError> {
            Err(SynthesisError::Randomness("entropy pool closed".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeZone;

    use super::{testing::*, *};

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap()
    }

    #[test]
    fn fields_come_from_inputs() {
        let synth = Synthesizer::new(FixedClock(instant()), SequentialIds::default());
        let event = synth.synthesize(SequenceIndex::new(42)).unwrap();

        assert_eq!(event.event_id, Uuid::from_u64_pair(0, 1));
        assert_eq!(event.actor_id, Uuid::from_u64_pair(0, 2));
        assert_eq!(event.produced_at, instant());
        assert_eq!(event.event_name, EVENT_NAME);
        assert_eq!(event.data.my_int, 42);
    }

    #[test]
    fn serializes_in_wire_order() {
        let synth = Synthesizer::new(FixedClock(instant()), SequentialIds::default());
        let event = synth.synthesize(SequenceIndex::new(7)).unwrap();

        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            concat!(
                r#"{"eventId":"00000000-0000-0000-0000-000000000001","#,
                r#""producedAt":"2024-03-09T12:30:05Z","#,
                r#""actorId":"00000000-0000-0000-0000-000000000002","#,
                r#""eventName":"myEvent","data":{"myInt":7}}"#
            )
        );
    }

    #[test]
    fn instant_keeps_subsecond_precision() {
        let ts = instant() + chrono::Duration::milliseconds(250);
        let synth = Synthesizer::new(FixedClock(ts), SequentialIds::default());
        let json = serde_json::to_value(synth.synthesize(SequenceIndex::ZERO).unwrap()).unwrap();
        assert_eq!(json["producedAt"], "2024-03-09T12:30:05.250Z");
    }

    #[test]
    fn random_ids_are_v4_and_distinct() {
        let ids = RandomIds;
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = ids.next_id().unwrap();
            assert_eq!(id.get_version_num(), 4);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn system_clock_is_after_epoch() {
        let now = SystemClock.now().unwrap();
        assert!(now.timestamp() > 1_600_000_000);
    }

    #[test]
    fn probe_surfaces_broken_randomness() {
        let synth = Synthesizer::new(FixedClock(instant()), BrokenIds);
        assert!(matches!(synth.probe(), Err(SynthesisError::Randomness(_))));
        assert!(Synthesizer::system().probe().is_ok());
    }
}
