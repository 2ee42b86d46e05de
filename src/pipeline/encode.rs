//! Image encoding: `DynamicImage` → base64 PNG wrapped in `ImageData`, and
//! component cropping.
//!
//! Pages arrive as JPEG scans but are re-encoded as PNG before they go to the
//! backend: a second lossy pass over small type blurs glyph edges that OCR
//! depends on. `detail: "high"` keeps hosted vision models on their full tile
//! budget; local backends ignore it.

use crate::model::BoundingBox;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as a base64 PNG ready for the backend.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let buf = png_bytes(img)?;
    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Raw PNG bytes, used for figure crops written to disk.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Cut a component's region out of its page.
pub fn crop(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    img.crop_imm(bbox.x_min(), bbox.y_min(), bbox.width(), bbox.height())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn crop_takes_the_box_region() {
        let mut page = RgbaImage::from_pixel(40, 30, Rgba([255, 255, 255, 255]));
        page.put_pixel(12, 11, Rgba([0, 0, 0, 255]));
        let page = DynamicImage::ImageRgba8(page);

        let bbox = BoundingBox::validate(&[10.0, 10.0, 20.0, 30.0], 40, 30).unwrap();
        let region = crop(&page, &bbox);
        assert_eq!(region.dimensions(), (10, 20));
        assert_eq!(region.get_pixel(2, 1), Rgba([0, 0, 0, 255]));
    }
}
