pub mod daily_materializer;
pub mod minute_enqueuer;
pub mod recovery_sweeper;

pub use daily_materializer::DailyMaterializer;
pub use minute_enqueuer::MinuteEnqueuer;
pub use recovery_sweeper::RecoverySweeper;
