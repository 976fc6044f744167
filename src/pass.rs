//! Pass descriptor shared by every layer's forward/backward/update step

/// Which kind of pass the graph is running.
///
/// `GradCheck` behaves like `Train` except that momentum accumulation is
/// suppressed everywhere, so finite-difference estimates compare against a
/// pure gradient step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Train,
    Eval,
    GradCheck,
}

impl Pass {
    /// Momentum coefficient to actually apply under this pass.
    pub fn effective_momentum(self, momentum: f32) -> f32 {
        match self {
            Pass::GradCheck => 0.0,
            _ => momentum,
        }
    }
}
