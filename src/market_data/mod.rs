pub mod aggregator;
pub mod calendar;
pub mod pipeline;
pub mod series_cache;

pub use aggregator::BarAggregator;
pub use calendar::SessionCalendar;
pub use pipeline::run_aggregation;
pub use series_cache::TimeframeCache;
