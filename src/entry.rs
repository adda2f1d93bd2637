//! Entry expiration options and the shared-store hash layout.
//!
//! Every entry lives in the shared store as a hash:
//!
//! | field    | content                                                    |
//! |----------|------------------------------------------------------------|
//! | `data`   | the cached bytes                                           |
//! | `absexp` | absolute expiration in ticks, `-1` when absent             |
//! | `sldexp` | sliding expiration in ticks, `-1` when absent              |
//!
//! A tick is 100 nanoseconds; absolute instants count ticks from
//! `0001-01-01T00:00:00Z`, which keeps the layout readable by other
//! clients sharing the same store.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::CacheError;

pub const DATA_FIELD: &str = "data";
pub const ABSOLUTE_EXPIRATION_FIELD: &str = "absexp";
pub const SLIDING_EXPIRATION_FIELD: &str = "sldexp";
pub const NOT_PRESENT: i64 = -1;

const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: u128 = 100;
/// Ticks between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Longest expiration window an entry may have: 100 years. Keeps every TTL
/// within what Redis `PEXPIRE` and `Instant` arithmetic accept.
pub const MAX_EXPIRATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Expiration settings for a single entry.
///
/// All fields are optional; an entry with none of them never expires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Fixed point in time at which the entry expires
    pub absolute_expiration: Option<SystemTime>,
    /// Expire this long after the write; wins over `absolute_expiration`
    pub absolute_expiration_relative_to_now: Option<Duration>,
    /// Expire after this long without access
    pub sliding_expiration: Option<Duration>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_absolute_expiration(mut self, at: SystemTime) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_absolute_expiration_relative_to_now(mut self, ttl: Duration) -> Self {
        self.absolute_expiration_relative_to_now = Some(ttl);
        self
    }

    pub fn with_sliding_expiration(mut self, idle: Duration) -> Self {
        self.sliding_expiration = Some(idle);
        self
    }

    /// The absolute deadline these options resolve to for a write at `now`.
    pub fn absolute_deadline(&self, now: SystemTime) -> Option<SystemTime> {
        match self.absolute_expiration_relative_to_now {
            Some(ttl) => now.checked_add(ttl),
            None => self.absolute_expiration,
        }
    }

    /// Reject options describing an entry that is already expired, or one
    /// whose expiration lies further out than [`MAX_EXPIRATION`].
    pub fn validate(&self, now: SystemTime) -> Result<(), CacheError> {
        if let Some(at) = self.absolute_expiration
            && self.absolute_expiration_relative_to_now.is_none()
            && at <= now
        {
            return Err(CacheError::InvalidOptions(
                "absolute expiration must be in the future".to_owned(),
            ));
        }
        if self.absolute_expiration_relative_to_now == Some(Duration::ZERO) {
            return Err(CacheError::InvalidOptions(
                "relative expiration must be positive".to_owned(),
            ));
        }
        if self.sliding_expiration == Some(Duration::ZERO) {
            return Err(CacheError::InvalidOptions(
                "sliding expiration must be positive".to_owned(),
            ));
        }
        if self
            .absolute_expiration_relative_to_now
            .is_some_and(|ttl| ttl > MAX_EXPIRATION)
            || self.sliding_expiration.is_some_and(|idle| idle > MAX_EXPIRATION)
        {
            return Err(CacheError::InvalidOptions(format!(
                "expiration must not exceed {MAX_EXPIRATION:?}"
            )));
        }
        if let Some(at) = self.absolute_expiration
            && self.absolute_expiration_relative_to_now.is_none()
            && at.duration_since(now).is_ok_and(|ttl| ttl > MAX_EXPIRATION)
        {
            return Err(CacheError::InvalidOptions(format!(
                "absolute expiration must be within {MAX_EXPIRATION:?}"
            )));
        }
        Ok(())
    }
}

/// Time left before an entry written with these settings expires, if it
/// expires at all. Sliding and absolute limits combine by taking the
/// earlier one.
pub fn time_to_live(
    absolute: Option<SystemTime>,
    sliding: Option<Duration>,
    now: SystemTime,
) -> Option<Duration> {
    let remaining = absolute.map(|at| at.duration_since(now).unwrap_or(Duration::ZERO));
    match (remaining, sliding) {
        (Some(a), Some(s)) => Some(a.min(s)),
        (a, s) => a.or(s),
    }
}

pub fn system_time_to_ticks(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(after) => UNIX_EPOCH_TICKS.saturating_add(duration_to_ticks(after)),
        Err(before) => UNIX_EPOCH_TICKS.saturating_sub(duration_to_ticks(before.duration())),
    }
}

pub fn ticks_to_system_time(ticks: i64) -> Option<SystemTime> {
    let offset = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    if offset >= 0 {
        UNIX_EPOCH.checked_add(ticks_to_duration(offset)?)
    } else {
        UNIX_EPOCH.checked_sub(ticks_to_duration(offset.checked_neg()?)?)
    }
}

pub fn duration_to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / NANOS_PER_TICK).unwrap_or(i64::MAX)
}

pub fn ticks_to_duration(ticks: i64) -> Option<Duration> {
    if ticks < 0 {
        return None;
    }
    let secs = (ticks / TICKS_PER_SECOND) as u64;
    let nanos = ((ticks % TICKS_PER_SECOND) as u32) * NANOS_PER_TICK as u32;
    Some(Duration::new(secs, nanos))
}

/// An entry as read back from the shared store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredEntry {
    pub data: Option<Vec<u8>>,
    pub options: EntryOptions,
}

impl StoredEntry {
    /// Decode the hash fields of a stored entry.
    ///
    /// Missing or unparsable expiration fields are treated as absent.
    pub fn from_fields(fields: &HashMap<String, Vec<u8>>) -> Self {
        let options = EntryOptions {
            absolute_expiration: read_ticks(fields, ABSOLUTE_EXPIRATION_FIELD)
                .and_then(ticks_to_system_time),
            absolute_expiration_relative_to_now: None,
            sliding_expiration: read_ticks(fields, SLIDING_EXPIRATION_FIELD)
                .and_then(ticks_to_duration),
        };

        Self {
            data: fields.get(DATA_FIELD).cloned(),
            options,
        }
    }

    /// Encode a write as hash fields, resolving relative expiration at `now`.
    pub fn to_fields(
        value: &[u8],
        options: &EntryOptions,
        now: SystemTime,
    ) -> Vec<(&'static str, Vec<u8>)> {
        let absolute = options
            .absolute_deadline(now)
            .map(system_time_to_ticks)
            .unwrap_or(NOT_PRESENT);
        let sliding = options
            .sliding_expiration
            .map(duration_to_ticks)
            .unwrap_or(NOT_PRESENT);

        vec![
            (ABSOLUTE_EXPIRATION_FIELD, absolute.to_string().into_bytes()),
            (SLIDING_EXPIRATION_FIELD, sliding.to_string().into_bytes()),
            (DATA_FIELD, value.to_vec()),
        ]
    }
}

fn read_ticks(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<i64> {
    let raw = fields.get(name)?;
    let ticks = std::str::from_utf8(raw).ok()?.trim().parse::<i64>().ok()?;
    (ticks != NOT_PRESENT).then_some(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_unix_epoch_ticks() {
        assert_eq!(system_time_to_ticks(UNIX_EPOCH), 621_355_968_000_000_000);
        assert_eq!(ticks_to_system_time(621_355_968_000_000_000), Some(UNIX_EPOCH));
        assert_eq!(
            system_time_to_ticks(UNIX_EPOCH + Duration::from_secs(1)),
            621_355_968_010_000_000
        );
    }

    #[test]
    fn test_duration_ticks() {
        assert_eq!(duration_to_ticks(Duration::from_secs(60)), 600_000_000);
        assert_eq!(
            ticks_to_duration(600_000_005),
            Some(Duration::new(60, 500))
        );
        assert_eq!(ticks_to_duration(-1), None);
    }

    #[test]
    fn test_from_fields_reads_data_and_expirations() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let abs = system_time_to_ticks(at).to_string();
        let entry = StoredEntry::from_fields(&fields(&[
            ("data", b"value"),
            ("absexp", abs.as_bytes()),
            ("sldexp", b"-1"),
        ]));

        assert_eq!(entry.data.as_deref(), Some(&b"value"[..]));
        assert_eq!(entry.options.absolute_expiration, Some(at));
        assert_eq!(entry.options.sliding_expiration, None);
    }

    #[test]
    fn test_from_fields_tolerates_malformed_metadata() {
        let entry = StoredEntry::from_fields(&fields(&[
            ("data", b"value"),
            ("absexp", b"not-a-number"),
        ]));

        assert_eq!(entry.data.as_deref(), Some(&b"value"[..]));
        assert_eq!(entry.options, EntryOptions::default());
    }

    #[test]
    fn test_to_fields_resolves_relative_expiration() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let options = EntryOptions::new()
            .with_absolute_expiration_relative_to_now(Duration::from_secs(10))
            .with_sliding_expiration(Duration::from_secs(5));

        let encoded: HashMap<String, Vec<u8>> = StoredEntry::to_fields(b"v", &options, now)
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        let decoded = StoredEntry::from_fields(&encoded);

        assert_eq!(
            decoded.options.absolute_expiration,
            Some(now + Duration::from_secs(10))
        );
        assert_eq!(
            decoded.options.sliding_expiration,
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_time_to_live_takes_earliest_limit() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let at = now + Duration::from_secs(30);
        assert_eq!(time_to_live(None, None, now), None);
        assert_eq!(
            time_to_live(Some(at), None, now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            time_to_live(Some(at), Some(Duration::from_secs(10)), now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            time_to_live(Some(now - Duration::from_secs(1)), None, now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_validate_rejects_past_absolute_expiration() {
        let now = SystemTime::now();
        let past = EntryOptions::new().with_absolute_expiration(now - Duration::from_secs(1));
        assert!(matches!(
            past.validate(now),
            Err(CacheError::InvalidOptions(_))
        ));
        assert!(EntryOptions::new().validate(now).is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_expiration() {
        let now = SystemTime::now();
        let too_long = [
            EntryOptions::new().with_sliding_expiration(Duration::MAX),
            EntryOptions::new().with_absolute_expiration_relative_to_now(Duration::MAX),
            EntryOptions::new()
                .with_absolute_expiration(now + MAX_EXPIRATION + Duration::from_secs(60)),
        ];
        for options in too_long {
            assert!(matches!(
                options.validate(now),
                Err(CacheError::InvalidOptions(_))
            ));
        }

        let longest = EntryOptions::new()
            .with_sliding_expiration(MAX_EXPIRATION)
            .with_absolute_expiration_relative_to_now(MAX_EXPIRATION);
        assert!(longest.validate(now).is_ok());
    }
}
