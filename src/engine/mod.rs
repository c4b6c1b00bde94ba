pub mod dispatch;
pub mod offer;
pub mod ranking;
pub mod sweeper;
