//! Request normalization: raw form inputs to canonical pipeline inputs.
//!
//! The user-facing form delivers a reference image and an "edit payload"
//! (background image plus drawn mask layers). This module flattens those
//! into the `(reference, edit image, edit mask)` triple the pipeline
//! expects, with the guarantee that the edit image and mask are either both
//! present or both absent.

use candle_core::Device;
use image::{DynamicImage, GrayImage};

use crate::config::PreprocessorSpec;
use crate::error::RequestError;
use crate::preprocess::PreprocessorHub;

/// A background image with pixel intensities summing below this is treated
/// as an untouched blank canvas, never as an edit target.
pub const BLANK_CANVAS_THRESHOLD: u64 = 1;

/// Raw edit input as delivered by the form: a background plus a stack of
/// drawn layers, topmost first. The top layer's alpha channel is the mask.
#[derive(Debug, Clone)]
pub struct EditPayload {
    pub background: DynamicImage,
    pub layers: Vec<DynamicImage>,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedInputs {
    pub reference_image: Option<DynamicImage>,
    pub edit_image: Option<DynamicImage>,
    pub edit_mask: Option<GrayImage>,
}

/// Converts raw inputs into the canonical triple, applying `edit_spec`'s
/// preprocessor when one is set. A `None` spec is the repainting case: the
/// edit image passes through unchanged and the mask is used as supplied.
pub fn normalize(
    reference_image: Option<&DynamicImage>,
    edit_payload: Option<&EditPayload>,
    edit_spec: Option<&PreprocessorSpec>,
    hub: &PreprocessorHub,
    device: &Device,
) -> Result<NormalizedInputs, RequestError> {
    let reference_image = reference_image.map(|img| DynamicImage::ImageRgb8(img.to_rgb8()));

    let (edit_image, edit_mask) = match edit_payload {
        None => (None, None),
        Some(payload) => extract_edit_pair(payload)?,
    };

    let edit_image = match (edit_image, &edit_mask, edit_spec) {
        (Some(image), Some(mask), Some(spec)) => {
            let preprocessor = hub.build(spec)?;
            let transformed = preprocessor
                .transform(device, &image, mask)
                .map_err(|e| RequestError::InvalidInput(format!("preprocessing failed: {e}")))?;
            Some(DynamicImage::ImageRgb8(transformed.to_rgb8()))
        }
        (image, _, _) => image,
    };

    debug_assert_eq!(edit_image.is_some(), edit_mask.is_some());
    Ok(NormalizedInputs {
        reference_image,
        edit_image,
        edit_mask,
    })
}

fn extract_edit_pair(
    payload: &EditPayload,
) -> Result<(Option<DynamicImage>, Option<GrayImage>), RequestError> {
    let top_layer = payload.layers.first().ok_or_else(|| {
        RequestError::InvalidInput("edit payload carries no mask layer".to_string())
    })?;
    if !top_layer.color().has_alpha() {
        return Err(RequestError::InvalidInput(
            "mask layer has no alpha channel".to_string(),
        ));
    }
    if (top_layer.width(), top_layer.height())
        != (payload.background.width(), payload.background.height())
    {
        return Err(RequestError::InvalidInput(format!(
            "mask layer is {}x{} but background is {}x{}",
            top_layer.width(),
            top_layer.height(),
            payload.background.width(),
            payload.background.height()
        )));
    }

    // An all-black background means the canvas was never painted on; the
    // mask layer is ignored entirely in that case.
    let background = payload.background.to_rgb8();
    let intensity: u64 = background.as_raw().iter().map(|&v| u64::from(v)).sum();
    if intensity < BLANK_CANVAS_THRESHOLD {
        return Ok((None, None));
    }

    let rgba = top_layer.to_rgba8();
    let mask = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        image::Luma([rgba.get_pixel(x, y)[3]])
    });
    Ok((Some(DynamicImage::ImageRgb8(background)), Some(mask)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, LumaA, Rgb, Rgba};
    use serde_json::Value;

    fn payload(background_value: u8) -> EditPayload {
        let background = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            8,
            8,
            Rgb([background_value; 3]),
        ));
        let mut layer = image::RgbaImage::new(8, 8);
        layer.put_pixel(2, 2, Rgba([0, 0, 0, 255]));
        EditPayload {
            background,
            layers: vec![DynamicImage::ImageRgba8(layer)],
        }
    }

    fn spec(kind: &str) -> PreprocessorSpec {
        PreprocessorSpec {
            kind: kind.into(),
            repainting_scale: None,
            params: Value::Null,
        }
    }

    #[test]
    fn no_payload_resolves_to_no_edit_pair() {
        let hub = PreprocessorHub::with_builtins();
        let out = normalize(None, None, None, &hub, &Device::Cpu).unwrap();
        assert!(out.edit_image.is_none());
        assert!(out.edit_mask.is_none());
    }

    #[test]
    fn blank_canvas_never_counts_as_an_edit_target() {
        let hub = PreprocessorHub::with_builtins();
        let out = normalize(None, Some(&payload(0)), None, &hub, &Device::Cpu).unwrap();
        assert!(out.edit_image.is_none());
        assert!(out.edit_mask.is_none());
    }

    #[test]
    fn mask_comes_from_the_top_layer_alpha() {
        let hub = PreprocessorHub::with_builtins();
        let out = normalize(None, Some(&payload(128)), None, &hub, &Device::Cpu).unwrap();
        let mask = out.edit_mask.unwrap();
        assert_eq!(mask.get_pixel(2, 2), &Luma([255]));
        assert_eq!(mask.get_pixel(0, 0), &Luma([0]));
        assert!(out.edit_image.is_some());
    }

    #[test]
    fn reference_image_is_converted_to_rgb() {
        let hub = PreprocessorHub::with_builtins();
        let reference = DynamicImage::ImageLumaA8(image::GrayAlphaImage::from_pixel(
            4,
            4,
            LumaA([77, 255]),
        ));
        let out = normalize(Some(&reference), None, None, &hub, &Device::Cpu).unwrap();
        assert!(matches!(
            out.reference_image,
            Some(DynamicImage::ImageRgb8(_))
        ));
    }

    #[test]
    fn repainting_passes_the_background_through_unchanged() {
        let hub = PreprocessorHub::with_builtins();
        let p = payload(128);
        let out = normalize(None, Some(&p), None, &hub, &Device::Cpu).unwrap();
        assert_eq!(
            out.edit_image.unwrap().to_rgb8().as_raw(),
            p.background.to_rgb8().as_raw()
        );
    }

    #[test]
    fn preprocessor_transforms_the_edit_image() {
        let hub = PreprocessorHub::with_builtins();
        let p = payload(128);
        let out = normalize(None, Some(&p), Some(&spec("invert")), &hub, &Device::Cpu).unwrap();
        let transformed = out.edit_image.unwrap().to_rgb8();
        assert_ne!(transformed.as_raw(), p.background.to_rgb8().as_raw());
        assert_eq!(transformed.get_pixel(4, 4), &Rgb([127, 127, 127]));
    }

    #[test]
    fn unknown_edit_type_fails_as_invalid_input() {
        let hub = PreprocessorHub::with_builtins();
        let err = normalize(
            None,
            Some(&payload(128)),
            Some(&spec("pose")),
            &hub,
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidInput(_)));
    }

    #[test]
    fn missing_mask_layer_is_invalid_input() {
        let hub = PreprocessorHub::with_builtins();
        let p = EditPayload {
            background: DynamicImage::new_rgb8(4, 4),
            layers: vec![],
        };
        let err = normalize(None, Some(&p), None, &hub, &Device::Cpu).unwrap_err();
        assert!(matches!(err, RequestError::InvalidInput(_)));
    }

    #[test]
    fn opaque_layer_without_alpha_is_invalid_input() {
        let hub = PreprocessorHub::with_builtins();
        let p = EditPayload {
            background: DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                4,
                4,
                Rgb([50, 50, 50]),
            )),
            layers: vec![DynamicImage::new_rgb8(4, 4)],
        };
        let err = normalize(None, Some(&p), None, &hub, &Device::Cpu).unwrap_err();
        assert!(matches!(err, RequestError::InvalidInput(_)));
    }
}
