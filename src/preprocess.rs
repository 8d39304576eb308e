//! Image decoding and per-family tensor preparation.
//!
//! Every family shares the 224x224x3 geometry; what differs is the resize
//! filter, the channel normalization and the memory layout the exported
//! network expects.

use std::{io::Cursor, str::FromStr};

use image::{
    DynamicImage, ImageDecoder, ImageReader, RgbImage, imageops::FilterType,
    metadata::Orientation,
};
use serde::{Deserialize, Serialize};

use crate::{error::ServiceError, model::ModelFamily};

pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Keras "caffe" means, BGR order, raw pixel scale.
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    Bilinear,
    Bicubic,
}

impl ResizeFilter {
    fn filter_type(self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Bilinear => FilterType::Triangle,
            ResizeFilter::Bicubic => FilterType::CatmullRom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// `p / 255`
    UnitScale,
    /// RGB to BGR, then subtract the ImageNet means at raw pixel scale.
    CaffeImagenet,
    /// `p / 127.5 - 1`
    SignedUnit,
    /// `(p / 255 - mean) / std` per channel.
    ImagenetStandard,
}

/// Which of the two VGG16 input conventions the deployed weights expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VggNormalization {
    #[default]
    Unit,
    Caffe,
}

impl VggNormalization {
    fn normalization(self) -> Normalization {
        match self {
            VggNormalization::Unit => Normalization::UnitScale,
            VggNormalization::Caffe => Normalization::CaffeImagenet,
        }
    }
}

impl FromStr for VggNormalization {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unit" | "rescale" => Ok(VggNormalization::Unit),
            "caffe" | "imagenet" => Ok(VggNormalization::Caffe),
            other => Err(ServiceError::BadRequest(format!(
                "unknown VGG normalization '{other}', expected unit or caffe"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Keras exports: `[1, 224, 224, 3]`.
    Nhwc,
    /// PyTorch exports: `[1, 3, 224, 224]`.
    Nchw,
}

/// Normalized image, stored height-major / channel-last regardless of the
/// layout the network wants.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    layout: TensorLayout,
}

impl ImageTensor {
    pub const SHAPE: [usize; 3] = [INPUT_SIZE as usize, INPUT_SIZE as usize, CHANNELS];

    pub fn zeros(layout: TensorLayout) -> Self {
        Self {
            data: vec![0.0; Self::SHAPE.iter().product()],
            layout,
        }
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn as_hwc(&self) -> &[f32] {
        &self.data
    }

    /// Values in the order of `self.layout()`.
    pub fn to_layout_vec(&self) -> Vec<f32> {
        match self.layout {
            TensorLayout::Nhwc => self.data.clone(),
            TensorLayout::Nchw => {
                let plane = Self::SHAPE[0] * Self::SHAPE[1];
                let mut chw = vec![0.0; self.data.len()];
                for (i, pixel) in self.data.chunks_exact(CHANNELS).enumerate() {
                    for (c, &value) in pixel.iter().enumerate() {
                        chw[c * plane + i] = value;
                    }
                }
                chw
            }
        }
    }

    /// Shape including the batch dimension, in `self.layout()` order.
    pub fn batched_shape(&self) -> [i64; 4] {
        let (h, w, c) = (
            Self::SHAPE[0] as i64,
            Self::SHAPE[1] as i64,
            Self::SHAPE[2] as i64,
        );
        match self.layout {
            TensorLayout::Nhwc => [1, h, w, c],
            TensorLayout::Nchw => [1, c, h, w],
        }
    }
}

/// Decodes any supported encoding to RGB, honoring EXIF orientation.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Decode("empty upload".into()));
    }
    let decode_err = |e: image::ImageError| ServiceError::Decode(e.to_string());

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ServiceError::Decode(e.to_string()))?;
    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    image.apply_orientation(orientation);
    Ok(image.to_rgb8())
}

/// Resize + normalize recipe for one model family. Pure and deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub filter: ResizeFilter,
    pub normalization: Normalization,
    pub layout: TensorLayout,
}

impl Preprocessor {
    pub fn vgg(convention: VggNormalization) -> Self {
        Self {
            filter: ResizeFilter::Bicubic,
            normalization: convention.normalization(),
            layout: TensorLayout::Nhwc,
        }
    }

    pub fn mobilenet() -> Self {
        Self {
            filter: ResizeFilter::Bicubic,
            normalization: Normalization::SignedUnit,
            layout: TensorLayout::Nhwc,
        }
    }

    pub fn transformer() -> Self {
        Self {
            filter: ResizeFilter::Bilinear,
            normalization: Normalization::ImagenetStandard,
            layout: TensorLayout::Nchw,
        }
    }

    /// `None` for families that never see pixels.
    pub fn for_family(family: ModelFamily, vgg: VggNormalization) -> Option<Self> {
        match family {
            ModelFamily::SingleBackbone | ModelFamily::VggFeatures => Some(Self::vgg(vgg)),
            ModelFamily::MobileNetFeatures => Some(Self::mobilenet()),
            ModelFamily::Transformer => Some(Self::transformer()),
            ModelFamily::MetaStack => None,
        }
    }

    pub fn prepare(&self, image: &RgbImage) -> ImageTensor {
        if image.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
            return self.normalize(image);
        }
        let resized = image::imageops::resize(
            image,
            INPUT_SIZE,
            INPUT_SIZE,
            self.filter.filter_type(),
        );
        self.normalize(&resized)
    }

    fn normalize(&self, image: &RgbImage) -> ImageTensor {
        let mut data = Vec::with_capacity(ImageTensor::SHAPE.iter().product());
        for pixel in image.pixels() {
            let [r, g, b] = pixel.0.map(f32::from);
            match self.normalization {
                Normalization::UnitScale => {
                    data.extend([r / 255.0, g / 255.0, b / 255.0]);
                }
                Normalization::CaffeImagenet => {
                    data.extend([
                        b - CAFFE_MEAN_BGR[0],
                        g - CAFFE_MEAN_BGR[1],
                        r - CAFFE_MEAN_BGR[2],
                    ]);
                }
                Normalization::SignedUnit => {
                    data.extend([r / 127.5 - 1.0, g / 127.5 - 1.0, b / 127.5 - 1.0]);
                }
                Normalization::ImagenetStandard => {
                    data.extend(
                        [r, g, b]
                            .iter()
                            .enumerate()
                            .map(|(c, v)| (v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]),
                    );
                }
            }
        }
        ImageTensor {
            data,
            layout: self.layout,
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgb};

    use super::*;

    fn gray(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn vgg_unit_scale_on_uniform_gray() {
        let tensor = Preprocessor::vgg(VggNormalization::Unit).prepare(&gray(300, 180, 128));
        assert_eq!(tensor.as_hwc().len(), 224 * 224 * 3);
        for &v in tensor.as_hwc() {
            assert!((v - 128.0 / 255.0).abs() < 1e-3, "got {v}");
        }
    }

    #[test]
    fn mobilenet_maps_into_signed_unit_range() {
        let black = Preprocessor::mobilenet().prepare(&gray(224, 224, 0));
        let white = Preprocessor::mobilenet().prepare(&gray(224, 224, 255));
        assert!(black.as_hwc().iter().all(|&v| (v + 1.0).abs() < 1e-6));
        assert!(white.as_hwc().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn transformer_uses_imagenet_statistics() {
        let tensor = Preprocessor::transformer().prepare(&gray(224, 224, 128));
        let x = 128.0 / 255.0;
        let pixel = &tensor.as_hwc()[..3];
        for c in 0..3 {
            let expected = (x - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((pixel[c] - expected).abs() < 1e-5);
        }
        assert_eq!(tensor.batched_shape(), [1, 3, 224, 224]);
    }

    #[test]
    fn caffe_convention_reorders_channels() {
        let image = RgbImage::from_pixel(224, 224, Rgb([200, 100, 50]));
        let tensor = Preprocessor::vgg(VggNormalization::Caffe).prepare(&image);
        let pixel = &tensor.as_hwc()[..3];
        assert!((pixel[0] - (50.0 - 103.939)).abs() < 1e-4);
        assert!((pixel[1] - (100.0 - 116.779)).abs() < 1e-4);
        assert!((pixel[2] - (200.0 - 123.68)).abs() < 1e-4);
    }

    #[test]
    fn chw_reordering_groups_planes() {
        let mut image = gray(224, 224, 0);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        let tensor = Preprocessor {
            filter: ResizeFilter::Nearest,
            normalization: Normalization::UnitScale,
            layout: TensorLayout::Nchw,
        }
        .prepare(&image);
        let chw = tensor.to_layout_vec();
        let plane = 224 * 224;
        assert_eq!(chw[0], 1.0);
        assert_eq!(chw[plane], 0.0);
        assert_eq!(chw[1], 0.0);
    }

    #[test]
    fn preparation_is_deterministic() {
        let image = RgbImage::from_fn(97, 61, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 7]));
        let pre = Preprocessor::transformer();
        assert_eq!(pre.prepare(&image), pre.prepare(&image));
    }

    #[test]
    fn decodes_png_and_rejects_garbage() {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(gray(10, 20, 128))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (10, 20));

        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(ServiceError::Decode(_))
        ));
        assert!(matches!(decode_image(&[]), Err(ServiceError::Decode(_))));
    }

    #[test]
    fn only_pixel_families_have_a_recipe() {
        let unit = VggNormalization::Unit;
        assert_eq!(
            Preprocessor::for_family(ModelFamily::VggFeatures, unit),
            Some(Preprocessor::vgg(unit))
        );
        assert_eq!(
            Preprocessor::for_family(ModelFamily::MobileNetFeatures, unit),
            Some(Preprocessor::mobilenet())
        );
        assert_eq!(Preprocessor::for_family(ModelFamily::MetaStack, unit), None);
    }

    #[test]
    fn vgg_convention_parses_from_config_strings() {
        assert_eq!("unit".parse::<VggNormalization>().unwrap(), VggNormalization::Unit);
        assert_eq!("CAFFE".parse::<VggNormalization>().unwrap(), VggNormalization::Caffe);
        assert!("zscore".parse::<VggNormalization>().is_err());
    }
}
