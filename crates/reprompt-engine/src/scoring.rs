use std::fmt;
use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::ServiceError;
use crate::lm::{ChatMessage, ChatRequest, ContentPart, LanguageModel};
use crate::payload::ImagePayload;

/// First image is the original, second the regeneration; the reply is a bare number.
pub const IMAGE_SIMILARITY_RUBRIC: &str = "\
以下の2枚の画像を比較し、どれほど似ているかを0.0〜1.0のスコアで評価してください。\
1枚目が元画像、2枚目が再生成された画像です。\
被写体、構図、色調、スタイルなどを総合的に評価し、\
スコアのみを数値(例: 0.75)で返してください。他のテキストは一切含めないでください。";

/// A judgment is a single number; anything longer is noise.
pub const SCORE_MAX_TOKENS: u64 = 10;

/// Similarity in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SimilarityScore(f64);

impl SimilarityScore {
    pub const ZERO: Self = Self(0.0);

    /// Clamps into range; NaN becomes 0.0.
    pub fn new(raw: f64) -> Self {
        if raw.is_nan() {
            return Self::ZERO;
        }
        Self(raw.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for SimilarityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unparseable judgments score 0.0 rather than failing.
pub fn parse_similarity_score(raw: &str) -> SimilarityScore {
    raw.trim()
        .parse::<f64>()
        .map(SimilarityScore::new)
        .unwrap_or(SimilarityScore::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRequest {
    pub original: ImagePayload,
    pub generated: ImagePayload,
    pub rubric_prompt: String,
}

impl ComparisonRequest {
    pub fn new(original: ImagePayload, generated: ImagePayload) -> Self {
        Self {
            original,
            generated,
            rubric_prompt: IMAGE_SIMILARITY_RUBRIC.to_string(),
        }
    }

    pub fn to_chat_request(&self, model: &str) -> ChatRequest {
        ChatRequest::new(
            model,
            vec![ChatMessage::user(vec![
                ContentPart::Text(self.rubric_prompt.clone()),
                ContentPart::ImageUrl(self.original.data_uri()),
                ContentPart::ImageUrl(self.generated.data_uri()),
            ])],
        )
        .with_max_tokens(Some(SCORE_MAX_TOKENS))
    }
}

/// Produces the raw textual judgment for a comparison.
pub trait SimilarityJudge: Send + Sync {
    fn name(&self) -> &str;
    fn judge(&self, request: &ComparisonRequest, model: &str) -> Result<String, ServiceError>;
}

/// Asks a vision-capable chat model for the score.
pub struct VisionJudge {
    lm: Arc<dyn LanguageModel>,
}

impl VisionJudge {
    pub fn new(lm: Arc<dyn LanguageModel>) -> Self {
        Self { lm }
    }
}

impl SimilarityJudge for VisionJudge {
    fn name(&self) -> &str {
        "vision"
    }

    fn judge(&self, request: &ComparisonRequest, model: &str) -> Result<String, ServiceError> {
        self.lm.complete(&request.to_chat_request(model))
    }
}

/// Offline judge averaging difference and average hashes of the two images.
pub struct PerceptualJudge;

impl SimilarityJudge for PerceptualJudge {
    fn name(&self) -> &str {
        "perceptual-hash"
    }

    fn judge(&self, request: &ComparisonRequest, _model: &str) -> Result<String, ServiceError> {
        let original = decode("original", &request.original)?;
        let generated = decode("generated", &request.generated)?;
        let dhash = score_hash(dhash64(&original), dhash64(&generated), 64);
        let ahash = score_hash(ahash64(&original), ahash64(&generated), 64);
        Ok(format!("{:.4}", ((dhash + ahash) / 2.0).clamp(0.0, 1.0)))
    }
}

fn decode(label: &str, payload: &ImagePayload) -> Result<DynamicImage, ServiceError> {
    image::load_from_memory(payload.bytes()).map_err(|err| {
        ServiceError::malformed("perceptual-hash", format!("cannot decode {label} image ({err})"))
    })
}

fn dhash64(image: &DynamicImage) -> u64 {
    let resized = image.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut value = 0u64;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let left = resized.get_pixel(x, y)[0];
            let right = resized.get_pixel(x + 1, y)[0];
            value = (value << 1) | u64::from(left > right);
        }
    }
    value
}

fn ahash64(image: &DynamicImage) -> u64 {
    let resized = image.resize_exact(8, 8, FilterType::Triangle).to_luma8();
    let sum: u64 = resized.pixels().map(|pixel| u64::from(pixel[0])).sum();
    let avg = sum as f64 / 64.0;
    let mut value = 0u64;
    for pixel in resized.pixels() {
        value = (value << 1) | u64::from(f64::from(pixel[0]) > avg);
    }
    value
}

fn score_hash(left: u64, right: u64, bits: u32) -> f64 {
    let distance = f64::from((left ^ right).count_ones());
    (1.0 - distance / f64::from(bits)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn png(width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 3]) -> anyhow::Result<ImagePayload> {
        let mut image = RgbImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb(paint(x, y));
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(ImagePayload::new(bytes, "image/png"))
    }

    #[test]
    fn judgments_are_clamped_and_fail_safe() {
        assert_eq!(parse_similarity_score("1.5").value(), 1.0);
        assert_eq!(parse_similarity_score("-0.3").value(), 0.0);
        assert_eq!(parse_similarity_score("0.85").value(), 0.85);
        assert_eq!(parse_similarity_score(" 0.85\n").value(), 0.85);
        assert_eq!(parse_similarity_score("not a number").value(), 0.0);
        assert_eq!(parse_similarity_score("NaN").value(), 0.0);
        assert_eq!(parse_similarity_score("inf").value(), 1.0);
        assert_eq!(parse_similarity_score("").value(), 0.0);
    }

    #[test]
    fn rubric_is_one_paragraph_naming_image_order() {
        assert!(!IMAGE_SIMILARITY_RUBRIC.contains('\n'));
        assert!(IMAGE_SIMILARITY_RUBRIC.starts_with("以下の2枚の画像を比較し"));
        assert!(IMAGE_SIMILARITY_RUBRIC.contains("1枚目が元画像、2枚目が再生成された画像です。"));
        assert!(IMAGE_SIMILARITY_RUBRIC.ends_with("他のテキストは一切含めないでください。"));
    }

    #[test]
    fn chat_request_orders_rubric_original_then_generated() {
        let request = ComparisonRequest::new(
            ImagePayload::new(b"orig".to_vec(), "image/jpeg"),
            ImagePayload::new(b"gen".to_vec(), "image/png"),
        );
        let chat = request.to_chat_request("gpt-4o-mini");
        assert_eq!(chat.model, "gpt-4o-mini");
        assert_eq!(chat.max_tokens, Some(SCORE_MAX_TOKENS));
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].text(), IMAGE_SIMILARITY_RUBRIC);
        assert_eq!(
            chat.messages[0].image_urls(),
            vec!["data:image/jpeg;base64,b3JpZw==", "data:image/png;base64,Z2Vu"]
        );
    }

    #[test]
    fn perceptual_judge_prefers_matching_images() -> anyhow::Result<()> {
        let gradient = png(32, 32, |x, _| [(x * 8) as u8, 0, 0])?;
        let reversed = png(32, 32, |x, _| [255 - (x * 8) as u8, 0, 0])?;

        let same = parse_similarity_score(
            &PerceptualJudge.judge(&ComparisonRequest::new(gradient.clone(), gradient.clone()), "")?,
        );
        let different = parse_similarity_score(
            &PerceptualJudge.judge(&ComparisonRequest::new(gradient, reversed), "")?,
        );
        assert_eq!(same.value(), 1.0);
        assert!(different.value() < same.value());
        Ok(())
    }

    #[test]
    fn perceptual_judge_rejects_undecodable_bytes() -> anyhow::Result<()> {
        let good = png(8, 8, |_, _| [1, 2, 3])?;
        let bad = ImagePayload::new(b"not an image".to_vec(), "image/png");
        let err = PerceptualJudge.judge(&ComparisonRequest::new(bad, good), "");
        assert!(matches!(err, Err(ServiceError::MalformedResponse { .. })));
        Ok(())
    }
}
