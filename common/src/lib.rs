pub mod error;
pub mod messages;
pub mod price;
pub mod task;

pub use error::{PriceBandError, ValidationError};
pub use messages::{
    ErrorBody, LedgerTransfer, Notification, OutputStream, PriceQuote, RegistryAnnouncement,
    ResizeRequest, RunSummary, SchedulerSnapshot, SessionCommand, SessionReply,
    SubmitTaskRequest, SubmitTaskResponse, TaskSummary,
};
pub use price::PriceProcess;
pub use task::{
    AccountId, Bid, BidderId, KilledBy, OutputDecl, OutputKind, TaskId, TaskRecord, TaskSpec,
    TaskState,
};
