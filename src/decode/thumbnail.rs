//! Bytes-to-thumbnail decoding

use std::num::NonZeroU32;

use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, RgbaImage};
use log::trace;

use super::DecodeError;
use crate::cache::Thumbnail;

/// Turns a cached image buffer into a thumbnail at most `width` pixels wide.
pub trait ThumbnailDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8], width: u32) -> Result<Thumbnail, DecodeError>;
}

/// Default decoder: `image` for the format, Lanczos3 via `fast_image_resize`.
///
/// Aspect ratio is preserved and images narrower than the target are kept
/// at their own size.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageThumbnailDecoder;

impl ThumbnailDecoder for ImageThumbnailDecoder {
    fn decode(&self, bytes: &[u8], width: u32) -> Result<Thumbnail, DecodeError> {
        if width == 0 {
            return Err(DecodeError::Resize("target width is zero".to_string()));
        }
        let img = image::load_from_memory(bytes).map_err(|e| DecodeError::Image(e.to_string()))?;
        let (src_width, src_height) = img.dimensions();
        if src_width <= width {
            return Ok(Thumbnail::new(img.to_rgba8()));
        }

        let scale = width as f32 / src_width as f32;
        let new_height = ((src_height as f32 * scale).round() as u32).max(1);
        trace!("Resizing {src_width}x{src_height} to {width}x{new_height}");

        let pixels = fast_resize(&img, width, new_height)?;
        Ok(Thumbnail::new(pixels))
    }
}

fn fast_resize(
    src: &DynamicImage,
    new_width: u32,
    new_height: u32,
) -> Result<RgbaImage, DecodeError> {
    let src_rgba = src.to_rgba8();
    let (src_width, src_height) = src_rgba.dimensions();

    let src_view = fr::Image::from_vec_u8(
        non_zero(src_width)?,
        non_zero(src_height)?,
        src_rgba.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| DecodeError::Resize(e.to_string()))?;

    let mut dst = fr::Image::new(non_zero(new_width)?, non_zero(new_height)?, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    resizer
        .resize(&src_view.view(), &mut dst.view_mut())
        .map_err(|e| DecodeError::Resize(e.to_string()))?;

    RgbaImage::from_raw(new_width, new_height, dst.into_vec())
        .ok_or_else(|| DecodeError::Resize("resized buffer has the wrong length".to_string()))
}

fn non_zero(value: u32) -> Result<NonZeroU32, DecodeError> {
    NonZeroU32::new(value).ok_or_else(|| DecodeError::Resize("zero image dimension".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn downscales_preserving_aspect() {
        let thumb = ImageThumbnailDecoder.decode(&png(400, 200), 100).unwrap();
        assert_eq!((thumb.width, thumb.height), (100, 50));
        assert_eq!(thumb.pixels.dimensions(), (100, 50));
    }

    #[test]
    fn never_upscales() {
        let thumb = ImageThumbnailDecoder.decode(&png(40, 60), 100).unwrap();
        assert_eq!((thumb.width, thumb.height), (40, 60));
    }

    #[test]
    fn wide_strip_keeps_one_pixel_height() {
        let thumb = ImageThumbnailDecoder.decode(&png(1000, 2), 10).unwrap();
        assert_eq!((thumb.width, thumb.height), (10, 1));
    }

    #[test]
    fn garbage_is_image_error() {
        let err = ImageThumbnailDecoder.decode(b"not an image", 100).unwrap_err();
        assert!(matches!(err, DecodeError::Image(_)));
    }
}
