mod job;

pub use job::{
    ErrorRecord, ExecutionOutcome, FailedJobEntry, IssueRecord, Job, JobOptions, JobParams,
    JobPriority, JobSnapshot, JobStatus, RecoveryStrategy, WorkFn,
};
