use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Store-assigned identifier of a queued message row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of the linear run workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Execute,
    Report,
    Notify,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Prepare,
        Phase::Execute,
        Phase::Report,
        Phase::Notify,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Execute => "execute",
            Phase::Report => "report",
            Phase::Notify => "notify",
            Phase::Cleanup => "cleanup",
        }
    }

    /// Successor after a successful phase; `None` at the terminal phase.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Prepare => Some(Phase::Execute),
            Phase::Execute => Some(Phase::Report),
            Phase::Report => Some(Phase::Notify),
            Phase::Notify => Some(Phase::Cleanup),
            Phase::Cleanup => None,
        }
    }

    /// Successor after a handled failure. A failed prepare skips execution
    /// and goes straight to reporting; later phases keep moving forward so
    /// the run still reaches notify and cleanup.
    pub fn next_after_failure(&self) -> Option<Phase> {
        match self {
            Phase::Prepare => Some(Phase::Report),
            other => other.next(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a phase name on the wire is not part of the workflow.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown phase: {0}")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// Drives one phase of a run. The phase travels as a string so that a bad
/// value survives decoding and is rejected by the handler, not the receiver.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunPhaseMessage {
    pub run_id: i64,
    pub environment_id: i64,
    pub phase: String,
}

impl RunPhaseMessage {
    pub fn new(run_id: i64, environment_id: i64, phase: Phase) -> Self {
        Self {
            run_id,
            environment_id,
            phase: phase.as_str().to_string(),
        }
    }

    pub fn phase(&self) -> Result<Phase, UnknownPhase> {
        self.phase.parse()
    }
}

/// Emitted by the cron schedule for a configured job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CronJobMessage {
    pub job_id: i64,
}

/// Emitted by the suite schedule; fans out into one run per environment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSuiteMessage {
    pub suite_id: i64,
}

/// Every message the transport carries. Payloads hold identifiers only;
/// handlers re-fetch entities on delivery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum QueueMessage {
    RunPhase(RunPhaseMessage),
    CronJob(CronJobMessage),
    ScheduledSuite(ScheduledSuiteMessage),
}

impl QueueMessage {
    pub const RUN_PHASE: &'static str = "run_phase";
    pub const CRON_JOB: &'static str = "cron_job";
    pub const SCHEDULED_SUITE: &'static str = "scheduled_suite";

    /// Routing name used in headers and by the handler router.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueMessage::RunPhase(_) => Self::RUN_PHASE,
            QueueMessage::CronJob(_) => Self::CRON_JOB,
            QueueMessage::ScheduledSuite(_) => Self::SCHEDULED_SUITE,
        }
    }

    /// Environment the message must be serialized with, if any.
    pub fn partition_affinity(&self) -> Option<i64> {
        match self {
            QueueMessage::RunPhase(message) => Some(message.environment_id),
            QueueMessage::CronJob(_) | QueueMessage::ScheduledSuite(_) => None,
        }
    }
}

impl From<RunPhaseMessage> for QueueMessage {
    fn from(value: RunPhaseMessage) -> Self {
        QueueMessage::RunPhase(value)
    }
}

impl From<CronJobMessage> for QueueMessage {
    fn from(value: CronJobMessage) -> Self {
        QueueMessage::CronJob(value)
    }
}

impl From<ScheduledSuiteMessage> for QueueMessage {
    fn from(value: ScheduledSuiteMessage) -> Self {
        QueueMessage::ScheduledSuite(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_chain_is_linear() {
        let mut phase = Phase::Prepare;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert!(Phase::Cleanup.is_terminal());
    }

    #[test]
    fn test_failed_prepare_skips_execute() {
        assert_eq!(Phase::Prepare.next_after_failure(), Some(Phase::Report));
        assert_eq!(Phase::Execute.next_after_failure(), Some(Phase::Report));
        assert_eq!(Phase::Notify.next_after_failure(), Some(Phase::Cleanup));
        assert_eq!(Phase::Cleanup.next_after_failure(), None);
    }

    #[test]
    fn test_unknown_phase_rejected() {
        let message = RunPhaseMessage {
            run_id: 1,
            environment_id: 1,
            phase: "deploy".into(),
        };
        assert_eq!(message.phase(), Err(UnknownPhase("deploy".into())));
    }

    #[test]
    fn test_affinity_only_for_run_phases() {
        let run: QueueMessage = RunPhaseMessage::new(5, 1, Phase::Execute).into();
        let cron: QueueMessage = CronJobMessage { job_id: 3 }.into();
        assert_eq!(run.partition_affinity(), Some(1));
        assert_eq!(cron.partition_affinity(), None);
        assert_eq!(run.kind(), "run_phase");
    }

    #[test]
    fn test_wire_shape_is_tagged() {
        let message: QueueMessage = ScheduledSuiteMessage { suite_id: 9 }.into();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "scheduled_suite");
        assert_eq!(json["payload"]["suite_id"], 9);
    }
}
