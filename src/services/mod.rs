mod jobhandle;
mod workerpool;
mod workmap;

pub mod jobqueue;
pub mod jobrunner;

pub use jobhandle::JobHandle;
pub use jobqueue::JobQueue;
pub use workerpool::WorkerPool;
pub use workmap::{WorkFn, WorkMap};
