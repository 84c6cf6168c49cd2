//! The transition registry: per-state ordered lists of guarded transitions.
//!
//! Conditions and actions are tagged variants; the engine interprets them.
//! Ordering within a state matters: the first transition whose condition
//! holds fires, and approval is checked before iteration so an approving
//! reply never triggers another refinement round.

use crate::store::IssueState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// A new comment containing the approval phrase exists.
    ApprovalPosted,
    /// New comments exist and none of them is an approval.
    NewCommentsWithoutApproval,
    /// The PR exists and its base has moved out from under it.
    RebaseNeeded,
    /// The dispatched feedback worker has exited.
    FeedbackWorkerDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Refine,
    Iterate,
    RecordApproval,
    StartBuild,
    AutoRebase,
    /// Pure state movement; the engine transitions without side effects.
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: IssueState,
    pub to: IssueState,
    pub condition: Condition,
    pub action: ActionKind,
}

const QUEUED: &[Transition] = &[Transition {
    from: IssueState::Queued,
    to: IssueState::Refining,
    condition: Condition::Always,
    action: ActionKind::Refine,
}];

const REFINING: &[Transition] = &[
    // Approval wins over iteration when both could fire this tick.
    Transition {
        from: IssueState::Refining,
        to: IssueState::Approved,
        condition: Condition::ApprovalPosted,
        action: ActionKind::RecordApproval,
    },
    Transition {
        from: IssueState::Refining,
        to: IssueState::Refining,
        condition: Condition::NewCommentsWithoutApproval,
        action: ActionKind::Iterate,
    },
];

const APPROVED: &[Transition] = &[Transition {
    from: IssueState::Approved,
    to: IssueState::Building,
    condition: Condition::Always,
    action: ActionKind::StartBuild,
}];

const IN_REVIEW: &[Transition] = &[Transition {
    from: IssueState::InReview,
    to: IssueState::InReview,
    condition: Condition::RebaseNeeded,
    action: ActionKind::AutoRebase,
}];

const ADDRESSING_FEEDBACK: &[Transition] = &[Transition {
    from: IssueState::AddressingFeedback,
    to: IssueState::InReview,
    condition: Condition::FeedbackWorkerDone,
    action: ActionKind::None,
}];

/// The ordered transitions evaluated for issues in the given state.
/// Merge-completion and review feedback for `in_review` issues are observed
/// by the review poller, not here.
pub fn transitions_for(state: IssueState) -> &'static [Transition] {
    match state {
        IssueState::Queued => QUEUED,
        IssueState::Refining => REFINING,
        IssueState::Approved => APPROVED,
        IssueState::InReview => IN_REVIEW,
        IssueState::AddressingFeedback => ADDRESSING_FEEDBACK,
        _ => &[],
    }
}
