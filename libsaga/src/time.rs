use std::fmt::{self, Display, Formatter};

/// nanoseconds since the unix epoch
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Ord, PartialOrd, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        // for testing we always have some fixed time so each run is deterministic
        // (commit oid depends on time which makes comparing oids impossible)
        if cfg!(test) {
            Self(0)
        } else {
            Self(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
