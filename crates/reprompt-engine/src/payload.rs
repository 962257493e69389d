use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Label used when the extension maps to no known media type.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";
/// Media type of images returned by the generation service.
pub const GENERATED_IMAGE_MIME: &str = "image/png";

/// Image bytes plus the media type they are sent under. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Reads the whole file; the media type comes from the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        Ok(Self::new(bytes, mime_for_path(path)))
    }

    pub fn from_base64(encoded: &str, mime_type: &str) -> Result<Self, base64::DecodeError> {
        let bytes = BASE64.decode(encoded.trim().as_bytes())?;
        Ok(Self::new(bytes, mime_type))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

/// Best-effort media type from the file extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(DEFAULT_IMAGE_MIME)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{mime_for_path, ImagePayload, DEFAULT_IMAGE_MIME};

    #[test]
    fn mime_follows_extension_with_jpeg_default() {
        assert_eq!(mime_for_path(Path::new("test.png")), "image/png");
        assert_eq!(mime_for_path(Path::new("test.jpg")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("photo.JPEG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("anim.gif")), "image/gif");
        assert_eq!(mime_for_path(Path::new("test.unknownext")), DEFAULT_IMAGE_MIME);
        assert_eq!(mime_for_path(Path::new("no_extension")), DEFAULT_IMAGE_MIME);
    }

    #[test]
    fn from_path_reads_bytes_and_labels_them() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("test.png");
        fs::write(&path, b"\x89PNG\r\n\x1a\n")?;

        let payload = ImagePayload::from_path(&path)?;
        assert_eq!(payload.mime_type(), "image/png");
        assert_eq!(payload.bytes(), b"\x89PNG\r\n\x1a\n");
        assert_eq!(payload.to_base64(), "iVBORw0KGgo=");
        assert_eq!(payload.data_uri(), "data:image/png;base64,iVBORw0KGgo=");
        Ok(())
    }

    #[test]
    fn encoding_is_a_pure_function_of_the_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = temp.path().join("a.unknownext");
        let second = temp.path().join("b.jpg");
        fs::write(&first, b"dummy")?;
        fs::write(&second, b"dummy")?;

        let a = ImagePayload::from_path(&first)?;
        let again = ImagePayload::from_path(&first)?;
        let b = ImagePayload::from_path(&second)?;
        assert_eq!(a.to_base64(), again.to_base64());
        assert_eq!(a.to_base64(), b.to_base64());
        assert_eq!(a.mime_type(), "image/jpeg");
        Ok(())
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ImagePayload::from_path(Path::new("/nonexistent/reference.png"));
        assert!(matches!(err, Err(ref io) if io.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn from_base64_rejects_garbage() {
        assert!(ImagePayload::from_base64("dGVzdA==", "image/png").is_ok());
        assert!(ImagePayload::from_base64("not base64!", "image/png").is_err());
    }
}
