//! Optional OCR collaborator.
//!
//! OCR tokens are auxiliary prompt context for the hi-res parser and
//! nothing more; a claim is never grounded in OCR output alone. The
//! engine is pluggable so hosts can wire in a platform recognizer.

use anyhow::Result;

use crate::geometry::PixelBox;

/// One recognized text token with its position in frame coordinates.
#[derive(Debug, Clone)]
pub struct OcrToken {
    pub text: String,
    pub bbox: PixelBox,
    pub confidence: f64,
}

/// Plain-text recognizer over PNG bytes. Implementations are expected to
/// be synchronous and CPU-bound; callers run them on a blocking thread.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, png_bytes: &[u8]) -> Result<Vec<OcrToken>>;
}

/// Default engine when the host supplies no recognizer.
pub struct NullOcr;

impl OcrEngine for NullOcr {
    fn recognize(&self, _png_bytes: &[u8]) -> Result<Vec<OcrToken>> {
        Ok(Vec::new())
    }
}

/// Tokens inside a region, rendered as prompt context lines.
pub fn context_lines(tokens: &[OcrToken], region: &PixelBox, max_lines: usize) -> Vec<String> {
    let mut inside: Vec<&OcrToken> = tokens
        .iter()
        .filter(|t| region.intersection_area(&t.bbox) > 0)
        .collect();
    // Top-to-bottom, left-to-right reading order.
    inside.sort_by_key(|t| (t.bbox.y, t.bbox.x));
    inside
        .iter()
        .take(max_lines)
        .map(|t| t.text.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str, x: u32, y: u32) -> OcrToken {
        OcrToken {
            text: text.to_string(),
            bbox: PixelBox::new(x, y, 40, 12),
            confidence: 0.9,
        }
    }

    #[test]
    fn context_lines_filters_to_region_in_reading_order() {
        let tokens = vec![
            token("outside", 900, 900),
            token("second", 10, 50),
            token("first", 10, 10),
        ];
        let region = PixelBox::new(0, 0, 200, 200);
        let lines = context_lines(&tokens, &region, 10);
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn context_lines_respects_cap() {
        let tokens: Vec<OcrToken> = (0..20).map(|i| token("t", 10, i * 20)).collect();
        let region = PixelBox::new(0, 0, 500, 500);
        assert_eq!(context_lines(&tokens, &region, 5).len(), 5);
    }
}
