//! The command server's state machine: which state transitions are legal, and which incoming
//! messages make sense to act on in a given state. Ported from `se_command_server.h`'s
//! `se_server_state` and `se_command_server.c`'s `is_valid_transition`/`msg_can_be_handled`.

use crate::proto::Tag;

/// `SE_(cmd_server_state)`, plus `GettingInitState`, which the original C tool never needed
/// (it read shadow registers directly); here it is the state the harness is in while its
/// forked child is snapshotting the tracee's state for `FetchInitialState` rather than
/// running the target to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    WaitForStart,
    Start,
    WaitForTarget,
    WaitForCmd,
    Fuzzing,
    SettingCtx,
    WaitingToExecute,
    Executing,
    GettingInitState,
    ReportError,
    Exit,
}

impl ServerState {
    /// `SE_(server_state_str)`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::WaitForStart => "WAIT_FOR_START",
            ServerState::Start => "START",
            ServerState::WaitForTarget => "WAIT_FOR_TARGET",
            ServerState::WaitForCmd => "WAIT_FOR_CMD",
            ServerState::Fuzzing => "FUZZING",
            ServerState::SettingCtx => "SETTING_CTX",
            ServerState::WaitingToExecute => "WAITING_TO_EXECUTE",
            ServerState::Executing => "EXECUTING",
            ServerState::GettingInitState => "GETTING_INIT_STATE",
            ServerState::ReportError => "REPORT_ERROR",
            ServerState::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `SE_(is_valid_transition)`: a transition to the same state, or to `Exit`, is always legal;
/// everything else follows the table below. `GettingInitState` shares `Executing`'s edges, per
/// the resolved Open Question in `DESIGN.md`.
pub fn is_valid_transition(current: ServerState, next: ServerState) -> bool {
    use ServerState::*;

    if next == current || next == Exit {
        return true;
    }

    match current {
        WaitForStart => next == Start,
        Start => next == WaitForTarget,
        WaitForTarget => next == WaitForCmd,
        WaitForCmd => next == Fuzzing || next == SettingCtx,
        Fuzzing | SettingCtx => next == WaitForCmd || next == WaitingToExecute,
        WaitingToExecute => next == WaitForCmd || next == Executing || next == GettingInitState,
        Executing | GettingInitState => next == WaitForCmd || next == ReportError,
        ReportError => next == WaitForCmd,
        Exit => false,
    }
}

/// `SE_(msg_can_be_handled)`: `Exit` is always admissible; otherwise admissibility depends on
/// the current state.
pub fn msg_can_be_handled(current: ServerState, tag: Tag) -> bool {
    use ServerState::*;

    if tag == Tag::Exit {
        return true;
    }

    match current {
        WaitForStart | WaitForTarget => matches!(tag, Tag::SetTgt | Tag::SetSoTgt),
        WaitForCmd => matches!(tag, Tag::SetTgt | Tag::SetSoTgt | Tag::Fuzz | Tag::SetCtx | Tag::Reset),
        Fuzzing | Executing | ReportError | SettingCtx | GettingInitState => tag == Tag::Reset,
        WaitingToExecute => matches!(tag, Tag::Reset | Tag::Execute | Tag::FetchInitialState),
        Start | Exit => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerState::*;

    #[test]
    fn test_exit_always_reachable() {
        for state in [
            WaitForStart, Start, WaitForTarget, WaitForCmd, Fuzzing, SettingCtx,
            WaitingToExecute, Executing, GettingInitState, ReportError,
        ] {
            assert!(is_valid_transition(state, Exit));
        }
        assert!(!is_valid_transition(Exit, WaitForStart));
    }

    #[test]
    fn test_same_state_always_valid() {
        for state in [WaitForStart, Start, WaitForTarget, WaitForCmd, Fuzzing, Executing, Exit] {
            assert!(is_valid_transition(state, state));
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(is_valid_transition(WaitForStart, Start));
        assert!(is_valid_transition(Start, WaitForTarget));
        assert!(is_valid_transition(WaitForTarget, WaitForCmd));
        assert!(is_valid_transition(WaitForCmd, Fuzzing));
        assert!(is_valid_transition(Fuzzing, WaitingToExecute));
        assert!(is_valid_transition(WaitingToExecute, Executing));
        assert!(is_valid_transition(Executing, WaitForCmd));
        assert!(is_valid_transition(ReportError, WaitForCmd));
    }

    #[test]
    fn test_getting_init_state_shares_executing_edges() {
        assert!(is_valid_transition(WaitingToExecute, GettingInitState));
        assert!(is_valid_transition(GettingInitState, WaitForCmd));
        assert!(is_valid_transition(GettingInitState, ReportError));
        assert!(!is_valid_transition(WaitForCmd, GettingInitState));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!is_valid_transition(WaitForStart, WaitForCmd));
        assert!(!is_valid_transition(WaitForCmd, Executing));
        assert!(!is_valid_transition(Executing, Fuzzing));
    }

    #[test]
    fn test_exit_message_always_handled() {
        for state in [WaitForStart, Fuzzing, Executing, ReportError, GettingInitState] {
            assert!(msg_can_be_handled(state, Tag::Exit));
        }
    }

    #[test]
    fn test_wait_for_cmd_accepts_expected_messages() {
        assert!(msg_can_be_handled(WaitForCmd, Tag::SetTgt));
        assert!(msg_can_be_handled(WaitForCmd, Tag::Fuzz));
        assert!(msg_can_be_handled(WaitForCmd, Tag::SetCtx));
        assert!(msg_can_be_handled(WaitForCmd, Tag::Reset));
        assert!(!msg_can_be_handled(WaitForCmd, Tag::Execute));
    }

    #[test]
    fn test_waiting_to_execute_accepts_execute_and_fetch() {
        assert!(msg_can_be_handled(WaitingToExecute, Tag::Execute));
        assert!(msg_can_be_handled(WaitingToExecute, Tag::FetchInitialState));
        assert!(!msg_can_be_handled(WaitingToExecute, Tag::SetTgt));
    }

    #[test]
    fn test_executing_only_accepts_reset() {
        assert!(msg_can_be_handled(Executing, Tag::Reset));
        assert!(!msg_can_be_handled(Executing, Tag::Execute));
        assert!(!msg_can_be_handled(Executing, Tag::Fuzz));
    }
}
