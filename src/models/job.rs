use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Error;

pub const DEFAULT_PRIORITY: i16 = 100;
pub const DEFAULT_ARGS: &str = "[]";
pub const DEFAULT_QUEUE: &str = "";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct JobRow {
    pub id: i64,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: String,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub queue: String,
}

/// Job to be enqueued. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NewJob {
    pub job_type: String,
    pub priority: Option<i16>,
    pub run_at: Option<DateTime<Utc>>,
    pub args: Option<String>,
    pub queue: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn json_args<T: Serialize>(self, args: &T) -> Result<Self, Error> {
        let args = serde_json::to_string(args).map_err(|_| Error::InvalidParams("args"))?;
        Ok(self.args(args))
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.job_type.is_empty() {
            return Err(Error::MissingType);
        }
        Ok(())
    }

    pub fn priority_or_default(&self) -> i16 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn args_or_default(&self) -> &str {
        self.args.as_deref().unwrap_or(DEFAULT_ARGS)
    }

    pub fn queue_or_default(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}

#[tokio::test]
async fn new_job_defaults() -> anyhow::Result<()> {
    // arrange
    let job = NewJob::new("MyJob");

    // act & assert
    assert!(job.validate().is_ok());
    assert_eq!(100, job.priority_or_default());
    assert_eq!("[]", job.args_or_default());
    assert_eq!("", job.queue_or_default());
    assert_eq!(None, job.run_at);
    Ok(())
}

#[tokio::test]
async fn new_job_empty_type_is_rejected() -> anyhow::Result<()> {
    // arrange
    let job = NewJob::new("").priority(1);

    // act
    let res = job.validate();

    // assert
    assert!(matches!(res, Err(Error::MissingType)));
    Ok(())
}

#[tokio::test]
async fn new_job_json_args() -> anyhow::Result<()> {
    // arrange
    let payload = serde_json::json!({ "arg1": 0, "arg2": "a string" });

    // act
    let job = NewJob::new("MyJob").json_args(&payload)?;

    // assert
    let parsed: serde_json::Value = serde_json::from_str(job.args_or_default())?;
    assert_eq!(payload, parsed);
    Ok(())
}
