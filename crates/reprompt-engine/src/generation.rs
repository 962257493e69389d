use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::ServiceError;
use crate::openai::OpenAiClient;
use crate::payload::{ImagePayload, GENERATED_IMAGE_MIME};

const IMAGES_GENERATIONS_PATH: &str = "images/generations";
const DRYRUN_MAX_EDGE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub size: String,
}

impl GenerationRequest {
    pub fn new(prompt: &str, model: &str, size: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            model: model.to_string(),
            size: size.to_string(),
        }
    }
}

/// Text-to-image backend returning exactly one image per call.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload, ServiceError>;
}

pub struct OpenAiImageGenerator {
    client: OpenAiClient,
}

impl OpenAiImageGenerator {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

/// What `data[0]` of an images response carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedImage {
    Inline(ImagePayload),
    /// Provider-hosted copy still to be downloaded.
    Hosted(String),
}

/// Reads `data[0].b64_json`, falling back to `data[0].url`.
pub fn extract_generated_image(response: &Value) -> Result<GeneratedImage, String> {
    let row = response
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .ok_or_else(|| "response has no data[0]".to_string())?;

    if let Some(b64) = row.get("b64_json").and_then(Value::as_str) {
        return ImagePayload::from_base64(b64, GENERATED_IMAGE_MIME)
            .map(GeneratedImage::Inline)
            .map_err(|err| format!("image base64 decode failed ({err})"));
    }
    match row.get("url").and_then(Value::as_str) {
        Some(url) => Ok(GeneratedImage::Hosted(url.to_string())),
        None => Err("data[0] carries neither b64_json nor url".to_string()),
    }
}

impl ImageGenerator for OpenAiImageGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload, ServiceError> {
        let payload = generation_payload(request);
        let response = self.client.post_json(IMAGES_GENERATIONS_PATH, &payload)?;
        let extracted = extract_generated_image(&response).map_err(|reason| {
            ServiceError::malformed(&self.client.endpoint(IMAGES_GENERATIONS_PATH), reason)
        })?;
        match extracted {
            GeneratedImage::Inline(image) => Ok(image),
            GeneratedImage::Hosted(url) => {
                let (bytes, _) = self.client.get_bytes(&url)?;
                Ok(ImagePayload::new(bytes, GENERATED_IMAGE_MIME))
            }
        }
    }
}

/// `gpt-image*` models always answer with base64 and reject `response_format`.
pub fn generation_payload(request: &GenerationRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "prompt": request.prompt,
        "size": request.size,
        "n": 1,
    });
    if !request.model.starts_with("gpt-image") {
        payload["response_format"] = Value::String("b64_json".to_string());
    }
    payload
}

/// Offline generator: a deterministic four-quadrant PNG derived from the prompt.
pub struct DryrunImageGenerator;

impl ImageGenerator for DryrunImageGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ImagePayload, ServiceError> {
        let (width, height) = parse_dims(&request.size);
        let width = width.min(DRYRUN_MAX_EDGE);
        let height = height.min(DRYRUN_MAX_EDGE);
        let palette = palette_from_prompt(&request.prompt);

        let mut image = RgbImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let quadrant = usize::from(x * 2 >= width) + 2 * usize::from(y * 2 >= height);
            *pixel = Rgb(palette[quadrant]);
        }

        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| ServiceError::malformed("dryrun", format!("png encode failed ({err})")))?;
        Ok(ImagePayload::new(bytes, GENERATED_IMAGE_MIME))
    }
}

fn palette_from_prompt(prompt: &str) -> [[u8; 3]; 4] {
    let digest = Sha256::digest(prompt.as_bytes());
    let mut palette = [[0u8; 3]; 4];
    for (idx, color) in palette.iter_mut().enumerate() {
        color.copy_from_slice(&digest[idx * 3..idx * 3 + 3]);
    }
    palette
}

/// `WxH` with a 1024x1024 fallback.
pub fn parse_dims(size: &str) -> (u32, u32) {
    let raw = size.trim().to_ascii_lowercase();
    if let Some((w, h)) = raw.split_once('x') {
        let width = w.trim().parse::<u32>().unwrap_or(1024);
        let height = h.trim().parse::<u32>().unwrap_or(1024);
        return (width.max(1), height.max(1));
    }
    (1024, 1024)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::StubServer;

    #[test]
    fn payload_requests_one_image_at_the_configured_size() {
        let request = GenerationRequest::new("A beautiful landscape", "gpt-image-1-mini", "1024x1024");
        assert_eq!(
            generation_payload(&request),
            json!({
                "model": "gpt-image-1-mini",
                "prompt": "A beautiful landscape",
                "size": "1024x1024",
                "n": 1,
            })
        );

        let legacy = GenerationRequest::new("cat", "dall-e-3", "1792x1024");
        assert_eq!(generation_payload(&legacy)["response_format"], json!("b64_json"));
    }

    #[test]
    fn extract_reads_inline_base64_first() {
        let response = json!({"data": [{"b64_json": "iVBORw0KGgo=", "url": "https://cdn.example/x.png"}]});
        let Ok(GeneratedImage::Inline(image)) = extract_generated_image(&response) else {
            panic!("expected inline image");
        };
        assert_eq!(image.bytes(), b"\x89PNG\r\n\x1a\n");
        assert_eq!(image.mime_type(), "image/png");
    }

    #[test]
    fn extract_falls_back_to_hosted_url() {
        let response = json!({"created": 1, "data": [{"url": "https://cdn.example/x.png"}]});
        assert_eq!(
            extract_generated_image(&response),
            Ok(GeneratedImage::Hosted("https://cdn.example/x.png".to_string()))
        );
    }

    #[test]
    fn extract_rejects_unusable_responses() {
        let bad_base64 = json!({"data": [{"b64_json": "not base64!"}]});
        assert!(extract_generated_image(&bad_base64)
            .err()
            .unwrap_or_default()
            .starts_with("image base64 decode failed"));

        assert_eq!(
            extract_generated_image(&json!({"data": []})),
            Err("response has no data[0]".to_string())
        );
        assert_eq!(
            extract_generated_image(&json!({"error": {"message": "quota"}})),
            Err("response has no data[0]".to_string())
        );
        assert_eq!(
            extract_generated_image(&json!({"data": [{"revised_prompt": "cat"}]})),
            Err("data[0] carries neither b64_json nor url".to_string())
        );
    }

    #[test]
    fn openai_generator_downloads_hosted_images() -> anyhow::Result<()> {
        let server = StubServer::start(2)?;
        let image_url = format!("{}/files/out.png", server.base_url());
        server.respond(200, &json!({"data": [{"url": image_url}]}).to_string());
        server.respond(200, "PNGBYTES");

        let client = OpenAiClient::new(&server.base_url(), Some("sk-test".to_string()), None)?;
        let image = OpenAiImageGenerator::new(client)
            .generate(&GenerationRequest::new("a cat", "gpt-image-1-mini", "1024x1024"))?;
        assert_eq!(image.bytes(), b"PNGBYTES");
        assert_eq!(image.mime_type(), "image/png");

        let requests = server.finish()?;
        assert!(requests[0].starts_with("POST /v1/images/generations "));
        assert!(requests[0].contains("\"prompt\":\"a cat\""));
        assert!(requests[1].starts_with("GET /files/out.png "));
        Ok(())
    }

    #[test]
    fn dims_parse_with_fallback() {
        assert_eq!(parse_dims("512x768"), (512, 768));
        assert_eq!(parse_dims(" 256X256 "), (256, 256));
        assert_eq!(parse_dims("auto"), (1024, 1024));
        assert_eq!(parse_dims("0x10"), (1, 10));
    }

    #[test]
    fn dryrun_is_deterministic_per_prompt() -> anyhow::Result<()> {
        let generator = DryrunImageGenerator;
        let first = generator.generate(&GenerationRequest::new("a red fox", "dryrun-image-1", "64x32"))?;
        let again = generator.generate(&GenerationRequest::new("a red fox", "dryrun-image-1", "64x32"))?;
        let other = generator.generate(&GenerationRequest::new("a blue whale", "dryrun-image-1", "64x32"))?;

        assert_eq!(first, again);
        assert_ne!(first.bytes(), other.bytes());
        assert_eq!(first.mime_type(), "image/png");

        let decoded = image::load_from_memory(first.bytes())?;
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
        Ok(())
    }

    #[test]
    fn dryrun_caps_large_sizes() -> anyhow::Result<()> {
        let payload =
            DryrunImageGenerator.generate(&GenerationRequest::new("x", "dryrun-image-1", "1024x1024"))?;
        let decoded = image::load_from_memory(payload.bytes())?;
        assert_eq!(decoded.width(), DRYRUN_MAX_EDGE);
        Ok(())
    }
}
