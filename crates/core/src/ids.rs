//! Time-ordered operation identifiers.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};
use ulid::{Generator, Ulid};

/// Process-wide monotonic generator so ids allocated in the same millisecond
/// still sort in allocation order.
static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Identifier of one GC or restore operation.
///
/// A 26-character ULID: lexicographic order equals creation order, which keeps
/// vault listings time-sorted without a separate timestamp index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(Ulid);

impl OperationId {
    /// Allocate a new id, monotonic within the process.
    pub fn generate() -> Self {
        let mut generator = GENERATOR
            .lock()
            .expect("operation id generator lock poisoned");
        // Overflow of the monotonic random component is only possible after
        // 2^80 ids in one millisecond; fall back to a fresh random ULID.
        Self(generator.generate().unwrap_or_else(|_| Ulid::new()))
    }

    /// The creation timestamp encoded in the id.
    pub fn timestamp(&self) -> time::OffsetDateTime {
        let millis = self.0.timestamp_ms();
        time::OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidOperationId(format!("{s:?}: {e}")))
    }
}

impl TryFrom<String> for OperationId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> String {
        id.to_string()
    }
}
