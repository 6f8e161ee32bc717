//! Transfers an authorized ebook from storage to the client.

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};

use crate::redemption::AuthorizedDownload;

#[derive(Clone)]
pub struct FileDelivery {
    client: reqwest::Client,
}

impl FileDelivery {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetches the file behind `download` and wraps it as an attachment.
    #[tracing::instrument(
        skip(self, download),
        fields(subject = %download.subject_id, resource = %download.resource_id)
    )]
    pub async fn deliver(&self, download: &AuthorizedDownload) -> anyhow::Result<Response> {
        let bytes = self
            .client
            .get(&download.file_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        tracing::debug!(size = bytes.len(), "fetched ebook from storage");

        let disposition = format!("attachment; filename=\"{}\"", download.filename);
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, download.content_type)
            .header(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_bytes(disposition.as_bytes())?,
            )
            .header(header::CONTENT_LENGTH, bytes.len())
            .header(header::CACHE_CONTROL, "private, no-store")
            .body(Body::from(bytes))?;

        Ok(response)
    }
}
