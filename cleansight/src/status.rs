//! Task state, cleaning procedure tracking, and status snapshots.
//!
//! Every client session carries a [`TaskStateMachine`]: the task phase, the
//! current cleaning step, and the latest detection flags. The
//! [`StatusBoard`] holds one per client and always answers snapshot queries,
//! returning the idle snapshot for clients with no active session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::FrameContext;
use crate::tasks::{BubbleTask, MotionTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Lifecycle phase of one client's cleaning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Terminated,
}

impl TaskPhase {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Terminated => "Terminated",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Idle => "no task is running",
            Self::Running => "cleaning task in progress",
            Self::Paused => "task is paused",
            Self::Completed => "cleaning task completed",
            Self::Error => "task failed",
            Self::Terminated => "task was terminated",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Idle | Self::Terminated => Severity::Info,
            Self::Running | Self::Completed => Severity::Success,
            Self::Paused => Severity::Warning,
            Self::Error => Severity::Error,
        }
    }

    /// Whether moving to `next` is a legal phase transition.
    fn can_transition_to(&self, next: TaskPhase) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Idle, Self::Error)
                | (Self::Idle, Self::Completed)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Error)
                | (Self::Running, Self::Terminated)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Completed)
                | (Self::Paused, Self::Error)
                | (Self::Paused, Self::Terminated)
                | (Self::Completed, Self::Idle)
                | (Self::Error, Self::Idle)
                | (Self::Terminated, Self::Idle)
        )
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The fixed eight-step cleaning procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleaningStep {
    Preparation,
    PreRinse,
    EnzymeWash,
    MainWash,
    Rinse,
    FinalRinse,
    Drying,
    Complete,
}

impl CleaningStep {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Preparation),
            1 => Some(Self::PreRinse),
            2 => Some(Self::EnzymeWash),
            3 => Some(Self::MainWash),
            4 => Some(Self::Rinse),
            5 => Some(Self::FinalRinse),
            6 => Some(Self::Drying),
            7 => Some(Self::Complete),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Preparation => "preparation",
            Self::PreRinse => "pre-rinse",
            Self::EnzymeWash => "enzyme wash",
            Self::MainWash => "main wash",
            Self::Rinse => "rinse",
            Self::FinalRinse => "final rinse",
            Self::Drying => "drying",
            Self::Complete => "complete",
        }
    }

    /// The following step; [`CleaningStep::Complete`] is terminal.
    pub fn next(&self) -> Self {
        Self::from_code(self.code() + 1).unwrap_or(Self::Complete)
    }
}

/// Latest per-frame detection flags of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectionFlags {
    pub bending: bool,
    pub bubble_detected: bool,
    pub fully_submerged: bool,
}

impl Default for DetectionFlags {
    fn default() -> Self {
        Self {
            bending: false,
            bubble_detected: false,
            fully_submerged: true,
        }
    }
}

/// Operator-facing alerts for the current detection flags.
pub fn alert_messages(flags: &DetectionFlags) -> Vec<String> {
    let mut messages = Vec::new();
    if flags.bubble_detected {
        messages.push("bubbles detected, possible air leak; check the line seals".to_string());
    }
    if flags.bending {
        messages.push("hose bend required".to_string());
    }
    if !flags.fully_submerged {
        messages.push("endoscope not fully submerged, adjust its position".to_string());
    }
    if messages.is_empty() {
        messages.push("equipment operating normally".to_string());
    }
    messages
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseInfo {
    pub code: &'static str,
    pub text: &'static str,
    pub message: &'static str,
    pub severity: Severity,
}

impl From<TaskPhase> for PhaseInfo {
    fn from(phase: TaskPhase) -> Self {
        Self {
            code: phase.code(),
            text: phase.text(),
            message: phase.message(),
            severity: phase.severity(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    pub code: u8,
    pub name: &'static str,
}

impl From<CleaningStep> for StepInfo {
    fn from(step: CleaningStep) -> Self {
        Self {
            code: step.code(),
            name: step.name(),
        }
    }
}

/// Point-in-time status snapshot for one client.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub client_id: Option<String>,
    pub status: PhaseInfo,
    pub cleaning_step: Option<StepInfo>,
    pub detection: Option<DetectionFlags>,
    pub bending_count: u64,
    pub messages: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// The snapshot served when a client has no active session.
    pub fn idle() -> Self {
        Self {
            client_id: None,
            status: TaskPhase::Idle.into(),
            cleaning_step: None,
            detection: None,
            bending_count: 0,
            messages: vec!["waiting for a session to start".to_string()],
            updated_at: None,
        }
    }
}

/// Phase, step, and detection state of one session.
#[derive(Debug)]
pub struct TaskStateMachine {
    client_id: String,
    phase: TaskPhase,
    step: CleaningStep,
    flags: DetectionFlags,
    bending_count: u64,
    updated_at: DateTime<Utc>,
}

impl TaskStateMachine {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            phase: TaskPhase::Idle,
            step: CleaningStep::Preparation,
            flags: DetectionFlags::default(),
            bending_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn step(&self) -> CleaningStep {
        self.step
    }

    /// Move to `next`, rejecting illegal transitions. Same-phase moves are
    /// no-ops.
    pub fn transition(&mut self, next: TaskPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::invalid_transition(
                self.phase.code(),
                next.code(),
            ));
        }
        if self.phase != next {
            debug!(client_id = %self.client_id, from = %self.phase, to = %next, "phase transition");
            self.phase = next;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn set_step(&mut self, step: CleaningStep) {
        self.step = step;
        self.updated_at = Utc::now();
    }

    /// Fold one frame's inference results into the detection flags.
    ///
    /// The bend counter increments on the rising edge of the bending flag,
    /// counting bend events rather than bending frames.
    pub fn apply_results(&mut self, context: &FrameContext) {
        if let Some(motion) = context.result(MotionTask::NAME)
            && motion.success
        {
            let bending = motion.flag("bending_detected");
            if bending && !self.flags.bending {
                self.bending_count += 1;
            }
            self.flags.bending = bending;
            self.flags.fully_submerged = motion.flag("fully_submerged");
        }
        if let Some(bubble) = context.result(BubbleTask::NAME)
            && bubble.success
        {
            self.flags.bubble_detected = bubble.flag("detected");
        }
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> TaskStatus {
        TaskStatus {
            client_id: Some(self.client_id.clone()),
            status: self.phase.into(),
            cleaning_step: Some(self.step.into()),
            detection: Some(self.flags),
            bending_count: self.bending_count,
            messages: alert_messages(&self.flags),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Per-client status registry. Snapshot queries always succeed.
#[derive(Default)]
pub struct StatusBoard {
    machines: DashMap<String, TaskStateMachine>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the machine for a new session, starting at idle.
    pub fn register(&self, client_id: &str) {
        self.machines
            .entry(client_id.to_string())
            .or_insert_with(|| TaskStateMachine::new(client_id));
    }

    /// Drop a client's machine; subsequent queries get the idle snapshot.
    pub fn remove(&self, client_id: &str) {
        self.machines.remove(client_id);
    }

    pub fn transition(&self, client_id: &str, next: TaskPhase) -> Result<()> {
        match self.machines.get_mut(client_id) {
            Some(mut machine) => machine.transition(next),
            None => Err(Error::SessionNotFound {
                client_id: client_id.to_string(),
            }),
        }
    }

    pub fn set_step(&self, client_id: &str, step: CleaningStep) {
        if let Some(mut machine) = self.machines.get_mut(client_id) {
            machine.set_step(step);
        }
    }

    pub fn apply_results(&self, client_id: &str, context: &FrameContext) {
        if let Some(mut machine) = self.machines.get_mut(client_id) {
            machine.apply_results(context);
        }
    }

    /// The current snapshot; idle when the client has no session.
    pub fn get_status(&self, client_id: &str) -> TaskStatus {
        match self.machines.get(client_id) {
            Some(machine) => machine.snapshot(),
            None => TaskStatus::idle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    use crate::frame::TaskResult;

    fn motion_result(bending: bool, submerged: bool) -> TaskResult {
        let mut payload = Map::new();
        payload.insert("bending_detected".into(), json!(bending));
        payload.insert("fully_submerged".into(), json!(submerged));
        TaskResult::ok(payload)
    }

    fn bubble_result(detected: bool) -> TaskResult {
        let mut payload = Map::new();
        payload.insert("detected".into(), json!(detected));
        TaskResult::ok(payload)
    }

    #[test]
    fn phase_transitions_are_validated() {
        let mut machine = TaskStateMachine::new("cam1");
        assert!(machine.transition(TaskPhase::Paused).is_err());
        machine.transition(TaskPhase::Running).unwrap();
        machine.transition(TaskPhase::Running).unwrap();
        machine.transition(TaskPhase::Paused).unwrap();
        machine.transition(TaskPhase::Running).unwrap();
        machine.transition(TaskPhase::Completed).unwrap();
        assert!(machine.transition(TaskPhase::Running).is_err());
        machine.transition(TaskPhase::Idle).unwrap();
    }

    #[test]
    fn cleaning_steps_are_ordered() {
        assert_eq!(CleaningStep::Preparation.code(), 0);
        assert_eq!(CleaningStep::Complete.code(), 7);
        assert_eq!(CleaningStep::Drying.next(), CleaningStep::Complete);
        assert_eq!(CleaningStep::Complete.next(), CleaningStep::Complete);
        assert_eq!(CleaningStep::from_code(3), Some(CleaningStep::MainWash));
        assert_eq!(CleaningStep::from_code(8), None);
    }

    #[test]
    fn alerts_reflect_flags() {
        let normal = alert_messages(&DetectionFlags::default());
        assert_eq!(normal, vec!["equipment operating normally"]);

        let flags = DetectionFlags {
            bending: true,
            bubble_detected: true,
            fully_submerged: false,
        };
        let alerts = alert_messages(&flags);
        assert_eq!(alerts.len(), 3);
        assert!(alerts[0].contains("air leak"));
    }

    #[test]
    fn bending_counts_rising_edges_only() {
        let mut machine = TaskStateMachine::new("cam1");
        let mut context = FrameContext::new();

        context.insert(MotionTask::NAME, motion_result(true, true));
        machine.apply_results(&context);
        machine.apply_results(&context);
        assert_eq!(machine.snapshot().bending_count, 1);

        context.insert(MotionTask::NAME, motion_result(false, true));
        machine.apply_results(&context);
        context.insert(MotionTask::NAME, motion_result(true, true));
        machine.apply_results(&context);
        assert_eq!(machine.snapshot().bending_count, 2);
    }

    #[test]
    fn failed_results_leave_flags_untouched() {
        let mut machine = TaskStateMachine::new("cam1");
        let mut context = FrameContext::new();
        context.insert(MotionTask::NAME, motion_result(true, false));
        context.insert(BubbleTask::NAME, bubble_result(true));
        machine.apply_results(&context);

        let mut context = FrameContext::new();
        context.insert(MotionTask::NAME, TaskResult::failed("no detection"));
        context.insert(BubbleTask::NAME, TaskResult::failed("no detection"));
        machine.apply_results(&context);

        let detection = machine.snapshot().detection.unwrap();
        assert!(detection.bending);
        assert!(detection.bubble_detected);
        assert!(!detection.fully_submerged);
    }

    #[test]
    fn board_always_answers() {
        let board = StatusBoard::new();
        let idle = board.get_status("ghost");
        assert_eq!(idle.status.code, "idle");
        assert!(idle.cleaning_step.is_none());
        assert_eq!(idle.messages, vec!["waiting for a session to start"]);

        board.register("cam1");
        board.transition("cam1", TaskPhase::Running).unwrap();
        board.set_step("cam1", CleaningStep::EnzymeWash);
        let status = board.get_status("cam1");
        assert_eq!(status.status.code, "running");
        assert_eq!(status.cleaning_step.unwrap().name, "enzyme wash");

        board.remove("cam1");
        assert_eq!(board.get_status("cam1").status.code, "idle");
        assert!(board.transition("cam1", TaskPhase::Running).is_err());
    }
}
