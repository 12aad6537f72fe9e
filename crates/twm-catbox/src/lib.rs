//! Image hosting on catbox.moe (anonymous uploads).

use async_trait::async_trait;

use twm_core::{errors::Error, media::image_extension, media::ImageHost, Result};

pub const CATBOX_API_URL: &str = "https://catbox.moe/user/api.php";

#[derive(Clone, Debug)]
pub struct CatboxClient {
    endpoint: String,
    http: reqwest::Client,
}

impl CatboxClient {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(CATBOX_API_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::External(format!("catbox client build error: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }
}

#[async_trait]
impl ImageHost for CatboxClient {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(format!("file.{}", image_extension(mime_type)))
            .mime_str(mime_type)
            .map_err(|e| Error::External(format!("catbox multipart error: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("reqtype", "fileupload")
            .part("fileToUpload", part);

        let resp = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::External(format!("catbox request error: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::External(format!(
                "catbox upload failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let url = parse_upload_response(&body)?;
        tracing::info!(size, url = %url, "image uploaded");
        Ok(url)
    }
}

/// The API answers with the bare file URL on success and a plain-text message otherwise.
fn parse_upload_response(body: &str) -> Result<String> {
    let url = body.trim();
    if url.starts_with("https://") || url.starts_with("http://") {
        return Ok(url.to_string());
    }
    Err(Error::External(format!(
        "catbox returned no url: {}",
        url.chars().take(200).collect::<String>()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_body_is_the_url() {
        assert_eq!(
            parse_upload_response("https://files.catbox.moe/abc123.jpg\n").unwrap(),
            "https://files.catbox.moe/abc123.jpg"
        );
        assert!(parse_upload_response("").is_err());
        assert!(parse_upload_response("File type not allowed").is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_external_error() {
        let client = CatboxClient::with_endpoint("http://127.0.0.1:9/user/api.php").unwrap();
        let err = client
            .upload(vec![0xff, 0xd8, 0xff], "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External(_)));
    }
}
