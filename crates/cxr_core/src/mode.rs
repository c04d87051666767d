//! Forward pass mode.

use serde::{Deserialize, Serialize};

/// Selects training or inference behaviour of a forward pass.
///
/// Burn layers decide between batch and running statistics from the backend
/// alone. The diagnostic model takes the mode explicitly so that explanation
/// passes on an autodiff backend still run with inference semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ForwardMode {
    /// Batch statistics, dropout, memory bank insertion and shadow update.
    Train,
    /// Running statistics, no dropout, no state mutation.
    #[default]
    Eval,
}

impl ForwardMode {
    /// Whether this is a training pass.
    #[must_use]
    pub const fn is_train(self) -> bool {
        matches!(self, ForwardMode::Train)
    }
}
