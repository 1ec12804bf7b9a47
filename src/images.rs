//! File-decode edge: turns an image file into a staged [`Bitmap`].

use std::path::Path;

use crate::bitmap::Bitmap;
use crate::error::Result;

/// Decode an image file into a canonical RGB8 bitmap.
///
/// Any format the `image` crate recognizes is accepted; alpha is dropped by
/// the RGB8 conversion. No resizing happens here, the vision encoder scales
/// its input itself.
pub fn load_bitmap(path: &Path) -> Result<Bitmap> {
    let decoded = image::open(path)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Bitmap::from_rgb8(width, height, rgb.into_raw())?)
}

#[cfg(test)]
mod tests {
    use super::load_bitmap;

    #[test]
    fn decodes_rgba_file_to_rgb_bitmap() {
        let base = std::env::temp_dir().join(format!("vlm_session_img_{}", std::process::id()));
        std::fs::create_dir_all(&base).expect("create temp dir");
        let path = base.join("probe.png");

        let mut img = image::RgbaImage::new(2, 2);
        img.put_pixel(0, 0, image::Rgba([10, 20, 30, 255]));
        img.save(&path).expect("write png");

        let bmp = load_bitmap(&path).expect("decode");
        assert_eq!(bmp.width(), 2);
        assert_eq!(bmp.height(), 2);
        assert_eq!(bmp.data().len(), 2 * 2 * 3);
        assert_eq!(&bmp.data()[..3], &[10, 20, 30]);

        let _ = std::fs::remove_dir_all(base);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_bitmap(std::path::Path::new("/nonexistent/probe.png")).is_err());
    }
}
