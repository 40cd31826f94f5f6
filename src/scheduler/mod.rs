pub mod orphan;
pub mod processor;
pub mod reaper;

pub use processor::{QueueProcessor, TickReport, DISAPPEARED_ERROR};
pub use reaper::UploadReaper;
