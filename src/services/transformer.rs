use exif::{In, Tag};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{DecodeError, EncodeError};
use crate::models::Variant;

/// Bounding box of the resized variant
pub const RESIZED_MAX: (u32, u32) = (1024, 768);

/// Bounding box of the thumbnail variant
pub const THUMBNAIL_MAX: (u32, u32) = (192, 192);

/// Quality the resized variant is encoded with
pub const RESIZED_QUALITY: u8 = 100;

/// Quality JPEG encoders use when none is requested
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSettings {
    pub resized_max: (u32, u32),
    pub resized_quality: u8,
    pub thumbnail_max: (u32, u32),
    pub thumbnail_quality: u8,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            resized_max: RESIZED_MAX,
            resized_quality: RESIZED_QUALITY,
            thumbnail_max: THUMBNAIL_MAX,
            thumbnail_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Outcome of one transform. Encode failures are reported per variant so the
/// caller decides whether they sink the whole item.
#[derive(Debug)]
pub struct TransformReport {
    pub orientation: Option<u32>,
    pub resized: Result<(u32, u32), EncodeError>,
    pub thumbnail: Result<(u32, u32), EncodeError>,
}

impl TransformReport {
    pub fn is_complete(&self) -> bool {
        self.resized.is_ok() && self.thumbnail.is_ok()
    }

    /// Variants that were written successfully.
    pub fn written(&self) -> Vec<Variant> {
        let mut variants = Vec::with_capacity(2);
        if self.resized.is_ok() {
            variants.push(Variant::Resized);
        }
        if self.thumbnail.is_ok() {
            variants.push(Variant::Thumbnail);
        }
        variants
    }

    pub fn first_error(self) -> Option<EncodeError> {
        self.resized.err().or(self.thumbnail.err())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTransformer {
    settings: TransformSettings,
}

impl ImageTransformer {
    pub fn new(settings: TransformSettings) -> Self {
        Self { settings }
    }

    /// Produces the resized and thumbnail variants of `source`.
    ///
    /// CPU bound; call it from a blocking context.
    pub fn transform(
        &self,
        source: &Path,
        resized_path: &Path,
        thumbnail_path: &Path,
    ) -> Result<TransformReport, DecodeError> {
        let img = image::io::Reader::open(source)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| DecodeError {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?
            .decode()
            .map_err(|e| DecodeError {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?;

        let orientation = read_orientation(source);
        let img = apply_orientation(img, orientation);

        let (max_w, max_h) = self.settings.resized_max;
        let resized = fit_within(img, max_w, max_h);
        let resized_result = write_jpeg(
            &resized,
            resized_path,
            self.settings.resized_quality,
            Variant::Resized,
        )
        .map(|_| (resized.width(), resized.height()));
        if let Err(e) = &resized_result {
            tracing::error!("Unable to save resized image: {}", e);
        }

        // The thumbnail is cut from the already resized image, not the original.
        let (max_w, max_h) = self.settings.thumbnail_max;
        let thumbnail = fit_within(resized, max_w, max_h);
        let thumbnail_result = write_jpeg(
            &thumbnail,
            thumbnail_path,
            self.settings.thumbnail_quality,
            Variant::Thumbnail,
        )
        .map(|_| (thumbnail.width(), thumbnail.height()));
        if let Err(e) = &thumbnail_result {
            tracing::error!("Unable to save thumbnail: {}", e);
        }

        Ok(TransformReport {
            orientation,
            resized: resized_result,
            thumbnail: thumbnail_result,
        })
    }
}

/// Reads the EXIF orientation tag. Missing or unreadable metadata yields `None`.
pub fn read_orientation(path: &Path) -> Option<u32> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    exif.get_field(Tag::Orientation, In::PRIMARY)?
        .value
        .get_uint(0)
}

/// Undoes camera rotation for orientations 3, 6 and 8. Mirrored orientations
/// (2, 4, 5, 7) are left untouched.
pub fn apply_orientation(img: DynamicImage, orientation: Option<u32>) -> DynamicImage {
    match orientation {
        Some(3) => img.rotate180(),
        // 270° counter-clockwise
        Some(6) => img.rotate90(),
        // 90° counter-clockwise
        Some(8) => img.rotate270(),
        _ => img,
    }
}

/// Downscales to fit the bounding box, keeping the aspect ratio. Never upscales.
pub fn fit_within(img: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if img.width() <= max_width && img.height() <= max_height {
        return img;
    }
    img.resize(max_width, max_height, FilterType::Lanczos3)
}

fn write_jpeg(
    img: &DynamicImage,
    path: &Path,
    quality: u8,
    variant: Variant,
) -> Result<(), EncodeError> {
    let encode_error = |reason: String| EncodeError {
        variant,
        path: path.to_path_buf(),
        reason,
    };

    let file = File::create(path).map_err(|e| encode_error(e.to_string()))?;
    let mut writer = BufWriter::new(file);

    // JPEG has no alpha channel and no 16-bit mode.
    let rgb = img.to_rgb8();
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| encode_error(e.to_string()))?;

    writer.flush().map_err(|e| encode_error(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    /// 3x2 image with only the top-left pixel set.
    fn marked() -> DynamicImage {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(0, 0, RED);
        DynamicImage::ImageRgba8(img)
    }

    fn red_at(img: &DynamicImage) -> (u32, u32) {
        img.pixels()
            .find(|(_, _, p)| *p == RED)
            .map(|(x, y, _)| (x, y))
            .unwrap()
    }

    #[test]
    fn test_orientation_six_rotates_a_quarter_turn_clockwise() {
        let out = apply_orientation(marked(), Some(6));
        assert_eq!(out.dimensions(), (2, 3));
        assert_eq!(red_at(&out), (1, 0));
    }

    #[test]
    fn test_orientation_eight_rotates_a_quarter_turn_counter_clockwise() {
        let out = apply_orientation(marked(), Some(8));
        assert_eq!(out.dimensions(), (2, 3));
        assert_eq!(red_at(&out), (0, 2));
    }

    #[test]
    fn test_orientation_three_rotates_half_turn() {
        let out = apply_orientation(marked(), Some(3));
        assert_eq!(out.dimensions(), (3, 2));
        assert_eq!(red_at(&out), (2, 1));
    }

    #[test]
    fn test_other_orientations_are_untouched() {
        for orientation in [None, Some(1), Some(2), Some(4), Some(5), Some(7), Some(42)] {
            let out = apply_orientation(marked(), orientation);
            assert_eq!(out.dimensions(), (3, 2));
            assert_eq!(red_at(&out), (0, 0));
        }
    }

    #[test]
    fn test_fit_within_preserves_aspect_ratio() {
        let img = DynamicImage::new_rgb8(3000, 1000);
        let out = fit_within(img, 1024, 768);
        assert_eq!(out.width(), 1024);
        assert!(out.height() <= 768);
        let expected = 1000.0 * 1024.0 / 3000.0;
        assert!((out.height() as f64 - expected).abs() <= 1.0);
    }

    #[test]
    fn test_fit_within_never_upscales() {
        let img = DynamicImage::new_rgb8(100, 50);
        let out = fit_within(img, 1024, 768);
        assert_eq!(out.dimensions(), (100, 50));
    }

    #[test]
    fn test_read_orientation() {
        let tmp = tempfile::tempdir().unwrap();
        let tagged = tmp.path().join("tagged.jpg");
        let plain = tmp.path().join("plain.jpg");
        std::fs::write(&tagged, fixtures::jpeg(16, 8, Some(6))).unwrap();
        std::fs::write(&plain, fixtures::jpeg(16, 8, None)).unwrap();

        assert_eq!(read_orientation(&tagged), Some(6));
        assert_eq!(read_orientation(&plain), None);
    }

    #[test]
    fn test_transform_produces_both_variants() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("landscape.jpg");
        let resized = tmp.path().join("resized.jpg");
        let thumb = tmp.path().join("thumb.jpg");
        std::fs::write(&source, fixtures::jpeg(2000, 1000, None)).unwrap();

        let report = ImageTransformer::default()
            .transform(&source, &resized, &thumb)
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.orientation, None);
        assert_eq!(image::image_dimensions(&resized).unwrap(), (1024, 512));
        assert_eq!(image::image_dimensions(&thumb).unwrap(), (192, 96));
    }

    #[test]
    fn test_transform_corrects_orientation_before_resizing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("portrait.jpg");
        let resized = tmp.path().join("resized.jpg");
        let thumb = tmp.path().join("thumb.jpg");
        std::fs::write(&source, fixtures::jpeg(2000, 1000, Some(6))).unwrap();

        let report = ImageTransformer::default()
            .transform(&source, &resized, &thumb)
            .unwrap();

        assert_eq!(report.orientation, Some(6));
        assert_eq!(image::image_dimensions(&resized).unwrap(), (384, 768));
        assert_eq!(image::image_dimensions(&thumb).unwrap(), (96, 192));
    }

    #[test]
    fn test_transform_rejects_non_images() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("notes.jpg");
        std::fs::write(&source, b"definitely not a jpeg").unwrap();

        let err = ImageTransformer::default()
            .transform(&source, &tmp.path().join("r.jpg"), &tmp.path().join("t.jpg"))
            .unwrap_err();
        assert_eq!(err.path, source);
    }

    #[test]
    fn test_encode_failure_is_reported_per_variant() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.jpg");
        std::fs::write(&source, fixtures::jpeg(64, 64, None)).unwrap();

        // A directory where the resized file should go cannot be opened for writing.
        let resized = tmp.path().join("resized.jpg");
        std::fs::create_dir(&resized).unwrap();
        let thumb = tmp.path().join("thumb.jpg");

        let report = ImageTransformer::default()
            .transform(&source, &resized, &thumb)
            .unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.written(), vec![Variant::Thumbnail]);
        assert!(thumb.exists());
        let err = report.first_error().unwrap();
        assert_eq!(err.variant, Variant::Resized);
    }
}
