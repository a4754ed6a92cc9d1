//! Perceptual hashing for the duplicate-frame skip heuristic.
//!
//! Two consecutive captures of an idle desktop hash to nearly the same
//! value; skipping them saves two vision passes with nothing new to
//! extract.

use anyhow::Result;
use image::ImageFormat;
use image_hasher::{HashAlg, HasherConfig, ImageHash};

/// Base64 perceptual hash of a frame's PNG bytes.
pub fn frame_phash(png_bytes: &[u8]) -> Result<String> {
    let img = image::load_from_memory_with_format(png_bytes, ImageFormat::Png)?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    Ok(hasher.hash_image(&img).to_base64())
}

/// Hamming distance between two encoded hashes. Unparseable input maps
/// to `u32::MAX` so it never passes a duplicate check.
pub fn hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}

pub fn is_duplicate(current: &str, previous: Option<&str>, threshold: u32) -> bool {
    match previous {
        Some(prev) => hamming_distance(current, prev) <= threshold,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_hashes_are_never_duplicates() {
        assert_eq!(hamming_distance("not base64 ?!", "also bad"), u32::MAX);
        assert!(!is_duplicate("not base64 ?!", Some("also bad"), 64));
    }

    #[test]
    fn first_frame_is_never_a_duplicate() {
        assert!(!is_duplicate("anything", None, 6));
    }
}
