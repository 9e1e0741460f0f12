//! Wire-stable types shared between the ticketsmith worker and anything that
//! enqueues work for it (ticket sync, operator API).
//!
//! Status and event strings defined here are persisted and consumed by other
//! layers; changing them is a breaking change.

mod payload;
mod status;

pub use payload::{
    JobCancelPayload, JobPermissionAnswerPayload, JobProcessPayload, JobResumePayload, JobSpec,
    TicketComment, topics,
};
pub use status::{JobLogEvent, JobStatus};
