// region:    Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Missing Job Type")]
    MissingType,

    #[error("Unknown Job Type - {0}")]
    UnknownJobType(String),

    #[error("Invalid Params - {0}")]
    InvalidParams(&'static str),

    #[error(transparent)]
    DbError(#[from] sqlx::Error),
}
// endregion: Error

/// Failure reported by a work function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::test]
async fn error_display_carries_context() -> anyhow::Result<()> {
    // arrange
    let unknown = Error::UnknownJobType("SendEmail".into());
    let missing = Error::MissingType;

    // act & assert
    assert_eq!("Unknown Job Type - SendEmail", unknown.to_string());
    assert_eq!("Missing Job Type", missing.to_string());
    Ok(())
}
