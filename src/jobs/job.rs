use getset::Getters;
use uuid::Uuid;

/// Lifecycle status of a job, stored as a `SMALLINT`.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum JobStatus {
    /// Enqueued and waiting to be claimed.
    Pending = 0,
    /// Claimed by a worker; either in flight or abandoned by a crashed
    /// process.
    Processing = 1,
    /// Exhausted its retries.
    Failed = 2,
}

/// A job handed to a worker by a successful claim.
#[derive(Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct ClaimedJob {
    id: Uuid,
    payload: Vec<u8>,
}

impl ClaimedJob {
    pub(crate) fn new(id: Uuid, payload: Vec<u8>) -> Self {
        ClaimedJob { id, payload }
    }
}
