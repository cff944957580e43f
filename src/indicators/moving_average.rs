/// Simple moving average over the last `period` values
///
/// Returns `None` when the series is shorter than the period or the period is zero.
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&prices, 5), Some(104.0));
        assert_eq!(calculate_sma(&prices, 2), Some(107.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        assert!(calculate_sma(&prices, 5).is_none());
        assert!(calculate_sma(&prices, 0).is_none());
    }
}
