// Price-series helpers backing the paper market

pub mod high;
pub mod moving_average;

pub use high::calculate_high;
pub use moving_average::calculate_sma;
