use shared::{
    domain::AttachmentKind,
    model::{Attachment, DraftMessage, Recording},
};

use crate::{error::UploadError, MediaUploader};

/// Resolve every local media handle and recording in `draft` into durable
/// URLs. All-or-nothing: the first failure aborts the send, so no message
/// with a partial attachment set is ever submitted.
pub(crate) async fn resolve_attachments(
    draft: &DraftMessage,
    uploader: &dyn MediaUploader,
) -> Result<(Vec<Attachment>, Option<Recording>), UploadError> {
    let mut attachments = Vec::with_capacity(draft.medias.len());
    for media in &draft.medias {
        let (thumbnail, full) = match media.kind {
            AttachmentKind::Image => {
                // One upload serves as both thumbnail and full reference.
                let url = uploader
                    .upload_image(media)
                    .await
                    .map_err(|source| UploadError::Media {
                        id: media.id.clone(),
                        source,
                    })?;
                (url.clone(), url)
            }
            AttachmentKind::Video => uploader
                .upload_video(media)
                .await
                .map_err(|source| UploadError::Media {
                    id: media.id.clone(),
                    source,
                })?,
        };
        attachments.push(Attachment {
            id: media.id.clone(),
            thumbnail,
            full,
            kind: media.kind,
        });
    }

    let recording = match &draft.recording {
        Some(recording) => {
            let url = uploader
                .upload_recording(recording)
                .await
                .map_err(UploadError::Recording)?;
            Some(Recording {
                duration: recording.duration,
                waveform_samples: recording.waveform_samples.clone(),
                url: Some(url),
            })
        }
        None => None,
    };

    Ok((attachments, recording))
}
