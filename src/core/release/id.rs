use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const STAMP_LEN: usize = 14;

/// Release directory name: a UTC timestamp, plus a sequence number when more
/// than one release is allocated within the same second.
///
/// Rendered as `20261019143005` or `20261019143005.2`. Ordered by timestamp,
/// then sequence, so `.10` sorts after `.9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReleaseId {
    stamp: String,
    seq: u32,
}

impl ReleaseId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self {
            stamp: time.format(STAMP_FORMAT).to_string(),
            seq: 0,
        }
    }

    /// Parse a directory name. Returns `None` for anything that is not a
    /// release (temporary links, stray files).
    pub fn parse(name: &str) -> Option<Self> {
        let (stamp, seq) = match name.split_once('.') {
            Some((stamp, seq)) => {
                if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let seq: u32 = seq.parse().ok()?;
                if seq == 0 {
                    return None;
                }
                (stamp, seq)
            }
            None => (name, 0),
        };

        if stamp.len() != STAMP_LEN || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;

        Some(Self {
            stamp: stamp.to_string(),
            seq,
        })
    }

    /// The smallest id strictly greater than `self`.
    pub fn next(&self) -> Self {
        Self {
            stamp: self.stamp.clone(),
            seq: self.seq + 1,
        }
    }

    /// Id for a release created at `now`, kept strictly above `latest` even
    /// when the clock has not advanced or moved backwards.
    pub fn after(now: DateTime<Utc>, latest: Option<&ReleaseId>) -> Self {
        let candidate = Self::from_time(now);
        match latest {
            Some(latest) if candidate <= *latest => latest.next(),
            _ => candidate,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl Ord for ReleaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ReleaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{}", self.stamp)
        } else {
            write!(f, "{}.{}", self.stamp, self.seq)
        }
    }
}

impl Serialize for ReleaseId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
