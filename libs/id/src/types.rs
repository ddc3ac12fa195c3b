//! Typed identifiers for cluster resources.
//!
//! `JobId` identifies one submission to the external batch scheduler.
//! `WorkerName` identifies one worker process; a job with multiplicity
//! `p` owns `p` worker names.

use crate::IdError;
use ulid::Ulid;

// =============================================================================
// Job ID
// =============================================================================

/// A typed ID for a batch-scheduler job submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(Ulid);

impl JobId {
    /// The prefix for job IDs.
    pub const PREFIX: &'static str = "job";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Creates an ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the timestamp portion of the ULID in milliseconds.
    ///
    /// Sorting by this value (or by the `JobId` itself) sorts jobs by
    /// submission time.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Parses an ID from a string in the format `job_{ulid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((prefix, ulid_str)) = s.split_once('_') else {
            return Err(IdError::MissingSeparator);
        };

        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }

        let ulid = ulid_str
            .parse::<Ulid>()
            .map_err(|e| IdError::InvalidUlid(e.to_string()))?;

        Ok(Self(ulid))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<Ulid> for JobId {
    fn as_ref(&self) -> &Ulid {
        &self.0
    }
}

// =============================================================================
// Worker Name
// =============================================================================

/// A validated worker process name.
///
/// Worker names are globally unique within a cluster and are the join
/// key between the controller's plan and the workers the compute
/// scheduler reports as connected. Names must be non-empty and free of
/// whitespace and commas (they appear verbatim in submission scripts
/// and log lines).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerName(String);

impl WorkerName {
    /// Validates and wraps a worker name.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::Empty);
        }
        if name.chars().any(|c| c.is_whitespace()) {
            return Err(IdError::InvalidWorkerName {
                name,
                reason: "whitespace is not allowed",
            });
        }
        if name.contains(',') {
            return Err(IdError::InvalidWorkerName {
                name,
                reason: "commas are not allowed",
            });
        }
        Ok(Self(name))
    }

    /// Derives the name of process `index` of job `job_id`.
    ///
    /// The format is `{prefix}-{ulid}-{index}`; with multiplicity `p`
    /// a job owns indices `0..p`.
    #[must_use]
    pub fn for_process(prefix: &str, job_id: JobId, index: u32) -> Self {
        Self(format!("{}-{}-{}", prefix, job_id.ulid(), index))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for WorkerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for WorkerName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for WorkerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
