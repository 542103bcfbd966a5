pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod fetcher;
pub mod proximity;
pub mod refresher;
pub mod sources;
