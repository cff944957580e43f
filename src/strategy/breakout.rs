/// Breakout trigger against a cached N-day high
///
/// Fires when the price strictly exceeds the baseline. After firing it stays
/// disarmed until the price comes back to or below the baseline, so a
/// recurring strategy buys once per breakout rather than once per poll.
#[derive(Debug, Clone)]
pub struct BreakoutTrigger {
    baseline: f64,
    armed: bool,
}

impl BreakoutTrigger {
    pub fn new(baseline: f64) -> Self {
        Self {
            baseline,
            armed: true,
        }
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Feed one polled price; returns true when the trigger fires
    pub fn observe(&mut self, price: f64) -> bool {
        if price > self.baseline {
            let fired = self.armed;
            self.armed = false;
            fired
        } else {
            self.armed = true;
            false
        }
    }
}
