pub mod position_tracker;

pub use position_tracker::PositionTracker;
