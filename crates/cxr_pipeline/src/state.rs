//! Lifecycle of a [`DiagnosisEngine`](crate::DiagnosisEngine).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current state of the engine.
///
/// ```text
/// Uninitialized -> WeightsLoaded -> Validated -> Ready
/// Ready -> Predicting -> Explaining -> Complete -> Ready
/// (smoke test or forward failure) -> Failed
/// ```
///
/// `Failed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No model has been built.
    #[default]
    Uninitialized,
    /// Model built and weights loaded or randomly initialized.
    WeightsLoaded,
    /// Smoke test passed.
    Validated,
    /// Accepting diagnosis requests.
    Ready,
    /// Forward pass in progress.
    Predicting,
    /// Saliency maps in progress.
    Explaining,
    /// The last request finished; new requests are accepted.
    Complete,
    /// Unrecoverable failure. The engine must be discarded.
    Failed,
}

impl EngineState {
    /// Whether a diagnosis request may start.
    pub fn accepts_requests(self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Complete)
    }

    /// Whether the engine can no longer be used.
    pub fn is_terminal(self) -> bool {
        self == EngineState::Failed
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: EngineState) -> bool {
        use EngineState::*;

        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Uninitialized, WeightsLoaded)
            | (WeightsLoaded, Validated)
            | (Validated, Ready)
            | (Ready | Complete, Predicting)
            | (Predicting, Explaining | Ready)
            | (Explaining, Complete)
            | (Complete, Ready) => true,
            _ => false,
        }
    }

    /// Lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::WeightsLoaded => "weights_loaded",
            EngineState::Validated => "validated",
            EngineState::Ready => "ready",
            EngineState::Predicting => "predicting",
            EngineState::Explaining => "explaining",
            EngineState::Complete => "complete",
            EngineState::Failed => "failed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
