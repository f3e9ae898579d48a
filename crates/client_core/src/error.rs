use thiserror::Error;

/// Attachment resolution failures. Upload is all-or-nothing per send: the
/// first failed upload aborts the whole message.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("attachment upload failed for media {id}: {source}")]
    Media {
        id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("voice recording upload failed: {0}")]
    Recording(#[source] anyhow::Error),
    #[error("no media uploader is configured")]
    UploaderUnavailable,
}

/// Send failures surfaced to the UI. The failed message stays visible
/// with `Error` status; retry is a user-initiated resubmission that mints
/// a fresh attempt, never an automatic loop.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("message submission failed: {0}")]
    Submission(#[source] anyhow::Error),
    #[error("conversation creation failed: {0}")]
    Creation(#[source] anyhow::Error),
    #[error("message {0} is not retryable")]
    NotRetryable(shared::domain::MessageId),
}
