//! Domain model (IDs, jobs, retry policy, outcomes, decisions, stats).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod options;
pub mod outcome;
pub mod pipeline;
pub mod retry;
pub mod stat;
pub mod state;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, JobsError};
pub use ids::{DeliveryId, JobId};
pub use job::{DeadLetterInfo, Job};
pub use options::PushOptions;
pub use outcome::{Outcome, OutcomeKind};
pub use pipeline::PipelineName;
pub use retry::RetryPolicy;
pub use stat::{BrokerStat, ConsumerStat, PipelineStat};
pub use state::DeliveryState;
