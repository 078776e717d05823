/// Accumulator for the auxiliary load-balancing loss of one forward pass
///
/// Owned by whoever drives the training step and passed by `&mut` to every
/// MoE layer, so no write can overlap a reset or a read.
///
/// Lifecycle: `reset_loss` at pass start, `add_loss` once per router call,
/// `get_loss` (or `take_loss`) after the pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxLossContext {
    total: f32,
    contributions: usize,
}

impl AuxLossContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_loss(&mut self) {
        self.total = 0.0;
        self.contributions = 0;
    }

    /// Add one layer's loss; never overwrites
    pub fn add_loss(&mut self, loss: f32) {
        self.total += loss;
        self.contributions += 1;
    }

    pub fn get_loss(&self) -> f32 {
        self.total
    }

    /// Read the total and zero the accumulator
    pub fn take_loss(&mut self) -> f32 {
        let total = self.total;
        self.reset_loss();
        total
    }

    /// Number of `add_loss` calls since the last reset
    pub fn contributions(&self) -> usize {
        self.contributions
    }
}
