use async_trait::async_trait;

use crate::Result;

/// Image hosting used for stored replies that carry an image.
#[async_trait]
pub trait ImageHost: Send + Sync {
    /// Upload `bytes` and return a public URL.
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String>;
}

/// File extension for an image mime type (`image/jpeg` → `jpg`).
pub fn image_extension(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}
