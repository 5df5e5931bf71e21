use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;

/// Provider-specific resize target for screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// OpenAI-family vision: shortest side pinned (768px).
    ShortestSide(u32),
    /// Claude-family vision: longest side pinned (1568px).
    LongestSide(u32),
}

impl ScaleTarget {
    pub fn for_model(claude_like: bool) -> Self {
        if claude_like {
            ScaleTarget::LongestSide(1568)
        } else {
            ScaleTarget::ShortestSide(768)
        }
    }
}

/// A screenshot resized for the model, plus the inverse factors needed to
/// map model-space coordinates back onto the device.
#[derive(Debug, Clone)]
pub struct ScaledImage {
    pub png: Vec<u8>,
    pub width_device: u32,
    pub height_device: u32,
    pub width_scaled: u32,
    pub height_scaled: u32,
    /// Multipliers from scaled space back to device space.
    pub scale_x: f64,
    pub scale_y: f64,
}

/// Resize a PNG screenshot to the provider target. Pure: same bytes and
/// target always produce the same output. Images already at or below the
/// target are passed through with identity factors.
pub fn scale_png(png: &[u8], target: ScaleTarget) -> anyhow::Result<ScaledImage> {
    let img = image::load_from_memory(png)?;
    let (w, h) = (img.width(), img.height());
    let ratio = match target {
        ScaleTarget::ShortestSide(side) => side as f64 / w.min(h) as f64,
        ScaleTarget::LongestSide(side) => side as f64 / w.max(h) as f64,
    };

    if ratio >= 1.0 {
        return Ok(ScaledImage {
            png: png.to_vec(),
            width_device: w,
            height_device: h,
            width_scaled: w,
            height_scaled: h,
            scale_x: 1.0,
            scale_y: 1.0,
        });
    }

    let sw = ((w as f64 * ratio).round() as u32).max(1);
    let sh = ((h as f64 * ratio).round() as u32).max(1);
    let resized = img.resize_exact(sw, sh, FilterType::Triangle);

    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, ImageFormat::Png)?;

    Ok(ScaledImage {
        png: out.into_inner(),
        width_device: w,
        height_device: h,
        width_scaled: sw,
        height_scaled: sh,
        scale_x: w as f64 / sw as f64,
        scale_y: h as f64 / sh as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(w, h, image::Rgba([40, 40, 40, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_shortest_side_target() {
        let png = solid_png(1080, 1920);
        let scaled = scale_png(&png, ScaleTarget::ShortestSide(768)).unwrap();
        assert_eq!(scaled.width_scaled, 768);
        assert_eq!(scaled.height_scaled, 1365);
        assert!((scaled.scale_x - 1080.0 / 768.0).abs() < 1e-9);
        // Round-tripping a scaled coordinate lands inside the device.
        let x = (760.0 * scaled.scale_x).round() as u32;
        assert!(x < 1080);
    }

    #[test]
    fn test_longest_side_target() {
        let png = solid_png(1080, 2400);
        let scaled = scale_png(&png, ScaleTarget::LongestSide(1568)).unwrap();
        assert_eq!(scaled.height_scaled, 1568);
        assert_eq!(scaled.width_scaled, 706);
    }

    #[test]
    fn test_small_image_passthrough() {
        let png = solid_png(320, 480);
        let scaled = scale_png(&png, ScaleTarget::ShortestSide(768)).unwrap();
        assert_eq!(scaled.width_scaled, 320);
        assert_eq!(scaled.height_scaled, 480);
        assert_eq!(scaled.scale_x, 1.0);
        assert_eq!(scaled.scale_y, 1.0);
        assert_eq!(scaled.png, png);
    }

    #[test]
    fn test_output_is_valid_png() {
        let png = solid_png(1440, 3120);
        let scaled = scale_png(&png, ScaleTarget::ShortestSide(768)).unwrap();
        let reloaded = image::load_from_memory(&scaled.png).unwrap();
        assert_eq!(reloaded.width(), scaled.width_scaled);
        assert_eq!(reloaded.height(), scaled.height_scaled);
    }

    #[test]
    fn test_target_selection() {
        assert_eq!(ScaleTarget::for_model(false), ScaleTarget::ShortestSide(768));
        assert_eq!(ScaleTarget::for_model(true), ScaleTarget::LongestSide(1568));
    }
}
