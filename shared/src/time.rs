use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Timestamps are kept at millisecond precision so they survive every store and the wire unchanged.
pub fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Next `updatedAt` for an entity last touched at `previous`, strictly greater than it.
pub fn next_update(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = normalize(now);
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}
