/// Highest value among the last `period` prices
pub fn calculate_high(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    prices[prices.len() - period..]
        .iter()
        .copied()
        .fold(None, |high, p| match high {
            Some(h) if h >= p => Some(h),
            _ => Some(p),
        })
}
