use serde::Serialize;

/// Short and long moving averages from one poll
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Averages {
    pub short: f64,
    pub long: f64,
}

impl Averages {
    pub fn new(short: f64, long: f64) -> Self {
        Self { short, long }
    }

    fn short_above(&self) -> bool {
        self.short > self.long
    }
}

/// Strict golden-cross detector
///
/// Compares each poll against the previous poll's relation: fires only when
/// short moves from at-or-below long to above it. The first observation seeds
/// the relation and never fires.
#[derive(Debug, Clone)]
pub struct CrossoverTrigger {
    short_period: u32,
    long_period: u32,
    previous: Option<Averages>,
}

impl CrossoverTrigger {
    pub fn new(short_period: u32, long_period: u32) -> Self {
        Self {
            short_period,
            long_period,
            previous: None,
        }
    }

    /// (short, long) SMA periods
    pub fn periods(&self) -> (u32, u32) {
        (self.short_period, self.long_period)
    }

    pub fn previous(&self) -> Option<Averages> {
        self.previous
    }

    /// Feed one poll's averages; returns true on a crossover
    pub fn observe(&mut self, current: Averages) -> bool {
        let crossed = match self.previous {
            Some(previous) => !previous.short_above() && current.short_above(),
            None => false,
        };
        self.previous = Some(current);
        crossed
    }
}
