pub use backoff::Backoff;
pub use error::BoxError;
pub use error::Error;
pub use job::JobRow;
pub use job::NewJob;
pub use job::{DEFAULT_ARGS, DEFAULT_PRIORITY, DEFAULT_QUEUE};
pub use state::instance_id;
pub use state::AppState;
pub use state::WorkerOptions;

mod backoff;
mod error;
mod job;
mod state;
