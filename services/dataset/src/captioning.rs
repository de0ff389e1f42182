use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Substrings the captioning service uses when it cannot decode the payload.
///
/// The service does not report a structured reason, so message text is the
/// only signal. Keep every use of it behind `is_undecodable_image_message`.
const UNDECODABLE_IMAGE_MARKERS: &[&str] = &[
    "base64 解码失败",
    "图片解码失败",
    "cannot identify image file",
];

/// Whether a failure message from the captioning service blames the image itself
pub fn is_undecodable_image_message(message: &str) -> bool {
    UNDECODABLE_IMAGE_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Errors returned by the captioning client
#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("captioning request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("captioning service error {code}: {msg}")]
    Service { code: i64, msg: String },

    /// The service could not decode the submitted image
    #[error("image could not be decoded: {0}")]
    UndecodableImage(String),

    #[error("malformed captioning response: {0}")]
    MalformedResponse(String),
}

impl CaptionError {
    /// Non-zero application code, split off into `UndecodableImage` when the
    /// message identifies a corrupt payload
    fn from_service(code: i64, msg: String) -> Self {
        if is_undecodable_image_message(&msg) {
            CaptionError::UndecodableImage(msg)
        } else {
            CaptionError::Service { code, msg }
        }
    }

    /// Non-200 response, classified the same way as application failures
    fn from_http(status: StatusCode, body: String) -> Self {
        if is_undecodable_image_message(&body) {
            CaptionError::UndecodableImage(body)
        } else {
            CaptionError::Http {
                status: status.as_u16(),
                body,
            }
        }
    }

    /// The image payload itself is bad, as opposed to a service or transport fault
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, CaptionError::UndecodableImage(_))
    }
}

/// Produces a caption for one image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Caption `image` (encoded as `format`) in the context of `category`
    async fn caption(&self, image: &[u8], category: &str, format: &str)
        -> Result<String, CaptionError>;
}

/// Request body for `POST /tag_image`
#[derive(Debug, Serialize)]
struct TagImageRequest<'a> {
    #[serde(serialize_with = "base64_serde::serialize")]
    image_base64: &'a [u8],
    category: &'a str,
    format: &'a str,
}

/// Response envelope of the captioning service
#[derive(Debug, Deserialize)]
struct TagImageResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: TagImageData,
}

#[derive(Debug, Default, Deserialize)]
struct TagImageData {
    #[serde(default)]
    caption: String,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::Serializer;

    pub fn serialize<S>(bytes: &&[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }
}

/// HTTP client for the external captioning service
pub struct CaptioningClient {
    http: reqwest::Client,
    tag_url: String,
}

impl CaptioningClient {
    /// Create a client for the service at `endpoint`
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CaptionError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            tag_url: format!("{}/tag_image", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Captioner for CaptioningClient {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn caption(
        &self,
        image: &[u8],
        category: &str,
        format: &str,
    ) -> Result<String, CaptionError> {
        let request = TagImageRequest {
            image_base64: image,
            category,
            format,
        };

        let response = self.http.post(&self.tag_url).json(&request).send().await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(CaptionError::from_http(status, body));
        }

        let parsed: TagImageResponse = serde_json::from_str(&body)
            .map_err(|e| CaptionError::MalformedResponse(e.to_string()))?;

        if parsed.code != 0 {
            return Err(CaptionError::from_service(parsed.code, parsed.msg));
        }

        debug!(caption_len = parsed.data.caption.len(), "Caption received");

        Ok(parsed.data.caption)
    }
}
