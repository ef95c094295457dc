//! Edit-type preprocessors.
//!
//! A preprocessor turns the canonical (edit image, mask) pair into the image
//! the pipeline is actually conditioned on, e.g. a structural extraction.
//! The hub maps edit-type kinds to constructors; external libraries can
//! register their own kinds next to the built-ins.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::Device;
use image::{DynamicImage, GrayImage};
use serde::Deserialize;

use crate::config::PreprocessorSpec;
use crate::error::RequestError;

pub trait Preprocessor: Send + Sync {
    fn transform(
        &self,
        device: &Device,
        image: &DynamicImage,
        mask: &GrayImage,
    ) -> Result<DynamicImage>;
}

impl std::fmt::Debug for dyn Preprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Preprocessor")
    }
}

type Factory = Box<dyn Fn(&PreprocessorSpec) -> Result<Box<dyn Preprocessor>> + Send + Sync>;

/// Registry of preprocessor constructors keyed by edit-type kind.
pub struct PreprocessorHub {
    factories: HashMap<String, Factory>,
}

impl Default for PreprocessorHub {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PreprocessorHub {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut hub = Self::empty();
        hub.register("gray", |_spec| Ok(Box::new(GrayAnnotator)));
        hub.register("invert", |_spec| Ok(Box::new(InvertAnnotator)));
        hub.register("mosaic", |spec| {
            let params: MosaicParams = if spec.params.is_null() {
                MosaicParams::default()
            } else {
                serde_json::from_value(spec.params.clone())?
            };
            Ok(Box::new(MosaicAnnotator {
                block_size: params.block_size.max(1),
            }))
        });
        hub
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&PreprocessorSpec) -> Result<Box<dyn Preprocessor>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Instantiates the preprocessor for `spec`, consuming its opaque
    /// parameters. Unknown kinds are an input error: the edit type was
    /// offered to the caller but nothing can back it.
    pub fn build(&self, spec: &PreprocessorSpec) -> Result<Box<dyn Preprocessor>, RequestError> {
        let factory = self.factories.get(&spec.kind).ok_or_else(|| {
            RequestError::InvalidInput(format!(
                "no preprocessor registered for edit type {:?}",
                spec.kind
            ))
        })?;
        factory(spec).map_err(|e| {
            RequestError::InvalidInput(format!("bad parameters for edit type {:?}: {e}", spec.kind))
        })
    }
}

/// Desaturation: the pipeline sees luminance only.
struct GrayAnnotator;

impl Preprocessor for GrayAnnotator {
    fn transform(
        &self,
        _device: &Device,
        image: &DynamicImage,
        _mask: &GrayImage,
    ) -> Result<DynamicImage> {
        Ok(DynamicImage::ImageRgb8(
            DynamicImage::ImageLuma8(image.to_luma8()).to_rgb8(),
        ))
    }
}

/// Value inversion.
struct InvertAnnotator;

impl Preprocessor for InvertAnnotator {
    fn transform(
        &self,
        _device: &Device,
        image: &DynamicImage,
        _mask: &GrayImage,
    ) -> Result<DynamicImage> {
        let mut out = image.to_rgb8();
        for pixel in out.pixels_mut() {
            for c in 0..3 {
                pixel[c] = 255 - pixel[c];
            }
        }
        Ok(DynamicImage::ImageRgb8(out))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MosaicParams {
    block_size: u32,
}

impl Default for MosaicParams {
    fn default() -> Self {
        Self { block_size: 16 }
    }
}

/// Block pixelation: downscale by the block size, then scale back up with
/// nearest-neighbour so each block is one flat color.
struct MosaicAnnotator {
    block_size: u32,
}

impl Preprocessor for MosaicAnnotator {
    fn transform(
        &self,
        _device: &Device,
        image: &DynamicImage,
        _mask: &GrayImage,
    ) -> Result<DynamicImage> {
        let (width, height) = (image.width(), image.height());
        let small_w = (width / self.block_size).max(1);
        let small_h = (height / self.block_size).max(1);
        let small = image.resize_exact(small_w, small_h, image::imageops::FilterType::Triangle);
        Ok(small.resize_exact(width, height, image::imageops::FilterType::Nearest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::{json, Value};

    fn spec(kind: &str, params: Value) -> PreprocessorSpec {
        PreprocessorSpec {
            kind: kind.into(),
            repainting_scale: None,
            params,
        }
    }

    fn sample_image() -> DynamicImage {
        let mut img = image::RgbImage::from_pixel(8, 8, Rgb([200, 40, 40]));
        img.put_pixel(0, 0, Rgb([0, 255, 0]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn unknown_kind_is_an_input_error() {
        let hub = PreprocessorHub::with_builtins();
        let err = hub.build(&spec("pose", Value::Null)).unwrap_err();
        assert!(matches!(err, RequestError::InvalidInput(_)));
    }

    #[test]
    fn gray_produces_three_channel_luminance() {
        let hub = PreprocessorHub::with_builtins();
        let pre = hub.build(&spec("gray", Value::Null)).unwrap();
        let mask = GrayImage::new(8, 8);
        let out = pre
            .transform(&Device::Cpu, &sample_image(), &mask)
            .unwrap()
            .to_rgb8();
        let p = out.get_pixel(3, 3);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn mosaic_respects_block_size_param() {
        let hub = PreprocessorHub::with_builtins();
        let pre = hub
            .build(&spec("mosaic", json!({"block_size": 4})))
            .unwrap();
        let mask = GrayImage::new(8, 8);
        let out = pre
            .transform(&Device::Cpu, &sample_image(), &mask)
            .unwrap();
        assert_eq!((out.width(), out.height()), (8, 8));
        // Every pixel of a 4x4 block is identical after pixelation.
        let rgb = out.to_rgb8();
        assert_eq!(rgb.get_pixel(4, 4), rgb.get_pixel(7, 7));
    }

    #[test]
    fn external_registration_extends_the_hub() {
        struct Noop;
        impl Preprocessor for Noop {
            fn transform(
                &self,
                _device: &Device,
                image: &DynamicImage,
                _mask: &GrayImage,
            ) -> Result<DynamicImage> {
                Ok(image.clone())
            }
        }
        let mut hub = PreprocessorHub::with_builtins();
        hub.register("pose", |_| Ok(Box::new(Noop)));
        assert!(hub.build(&spec("pose", Value::Null)).is_ok());
    }
}
