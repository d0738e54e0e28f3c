//! Letterbox resizing and tensor layout for detection input

use half::f16;
use image::{imageops, Rgb, RgbImage};
use ndarray::{s, Array4, Axis};
use tracing::warn;

/// Grey used to fill letterbox borders
pub const PAD_COLOR: u8 = 114;

/// Round an inference size up to a multiple of the model stride.
pub fn check_img_size(imgsz: (u32, u32), stride: u32) -> (u32, u32) {
    let stride = stride.max(1);
    let round_up = |x: u32| x.div_ceil(stride) * stride;
    let checked = (round_up(imgsz.0), round_up(imgsz.1));
    if checked != imgsz {
        warn!(
            "--imgsz {:?} must be multiple of max stride {}, updating to {:?}",
            imgsz, stride, checked
        );
    }
    checked
}

/// Aspect-preserving resize onto a fixed canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    /// Target (height, width)
    pub shape: (u32, u32),
}

impl Letterbox {
    pub fn new(shape: (u32, u32)) -> Self {
        Self { shape }
    }

    /// Resize `image` to fit the canvas and centre it between grey borders.
    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (new_h, new_w) = self.shape;
        let (w, h) = image.dimensions();
        let ratio = (new_h as f32 / h as f32).min(new_w as f32 / w as f32);

        let unpad_w = ((w as f32 * ratio).round() as u32).clamp(1, new_w);
        let unpad_h = ((h as f32 * ratio).round() as u32).clamp(1, new_h);
        let dw = (new_w - unpad_w) as f32 / 2.0;
        let dh = (new_h - unpad_h) as f32 / 2.0;

        let resized;
        let content = if (w, h) != (unpad_w, unpad_h) {
            resized = imageops::resize(image, unpad_w, unpad_h, imageops::FilterType::Triangle);
            &resized
        } else {
            image
        };

        let top = (dh - 0.1).round().max(0.0) as i64;
        let left = (dw - 0.1).round().max(0.0) as i64;
        let mut canvas = RgbImage::from_pixel(new_w, new_h, Rgb([PAD_COLOR; 3]));
        imageops::replace(&mut canvas, content, left, top);
        canvas
    }

    /// Letterbox every image and stack them as `[B, 3, H, W]` bytes.
    pub fn batch(&self, images: &[&RgbImage]) -> Array4<u8> {
        let (h, w) = (self.shape.0 as usize, self.shape.1 as usize);
        let mut pixels = Array4::<u8>::zeros((images.len(), 3, h, w));
        for (mut slot, image) in pixels.axis_iter_mut(Axis(0)).zip(images) {
            let boxed = self.apply(image);
            for (x, y, pixel) in boxed.enumerate_pixels() {
                for c in 0..3 {
                    slot[[c, y as usize, x as usize]] = pixel[c];
                }
            }
        }
        pixels
    }
}

/// Normalized model input in the precision the backend expects
#[derive(Debug, Clone)]
pub enum InputTensor {
    Full(Array4<f32>),
    Half(Array4<f16>),
}

impl InputTensor {
    /// Scale bytes to [0, 1], casting to half precision when requested.
    pub fn from_pixels(pixels: &Array4<u8>, half: bool) -> Self {
        if half {
            InputTensor::Half(pixels.mapv(|v| f16::from_f32(v as f32 / 255.0)))
        } else {
            InputTensor::Full(pixels.mapv(|v| v as f32 / 255.0))
        }
    }

    /// Zero tensor of the given `[B, 3, H, W]` shape, used for warmup.
    pub fn zeros(shape: [usize; 4], half: bool) -> Self {
        if half {
            InputTensor::Half(Array4::from_elem(shape, f16::ZERO))
        } else {
            InputTensor::Full(Array4::zeros(shape))
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let dims = match self {
            InputTensor::Full(t) => t.dim(),
            InputTensor::Half(t) => t.dim(),
        };
        [dims.0, dims.1, dims.2, dims.3]
    }

    pub fn batch_size(&self) -> usize {
        self.shape()[0]
    }

    pub fn is_half(&self) -> bool {
        matches!(self, InputTensor::Half(_))
    }

    /// Split into single-image tensors along the batch axis.
    pub fn split(&self) -> Vec<InputTensor> {
        (0..self.batch_size())
            .map(|i| match self {
                InputTensor::Full(t) => InputTensor::Full(t.slice(s![i..i + 1, .., .., ..]).to_owned()),
                InputTensor::Half(t) => InputTensor::Half(t.slice(s![i..i + 1, .., .., ..]).to_owned()),
            })
            .collect()
    }

    /// Full-precision view of the data, converting from half if needed.
    pub fn to_f32(&self) -> Array4<f32> {
        match self {
            InputTensor::Full(t) => t.clone(),
            InputTensor::Half(t) => t.mapv(f16::to_f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_img_size() {
        assert_eq!(check_img_size((640, 640), 32), (640, 640));
        assert_eq!(check_img_size((641, 100), 32), (672, 128));
        assert_eq!(check_img_size((1, 1), 0), (1, 1));
    }

    #[test]
    fn test_letterbox_wide_image_pads_vertically() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
        let boxed = Letterbox::new((64, 64)).apply(&image);
        assert_eq!(boxed.dimensions(), (64, 64));
        // content is 64x32 centred with 16 px bands above and below
        assert_eq!(boxed.get_pixel(32, 0), &Rgb([PAD_COLOR; 3]));
        assert_eq!(boxed.get_pixel(32, 63), &Rgb([PAD_COLOR; 3]));
        assert_eq!(boxed.get_pixel(32, 32), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_letterbox_same_size_is_identity() {
        let image = RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8, y as u8, 7]));
        let boxed = Letterbox::new((32, 32)).apply(&image);
        assert_eq!(boxed, image);
    }

    #[test]
    fn test_batch_layout_is_chw() {
        let a = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let b = RgbImage::from_pixel(8, 8, Rgb([40, 50, 60]));
        let pixels = Letterbox::new((8, 8)).batch(&[&a, &b]);
        assert_eq!(pixels.dim(), (2, 3, 8, 8));
        assert_eq!(pixels[[0, 0, 3, 3]], 10);
        assert_eq!(pixels[[0, 2, 3, 3]], 30);
        assert_eq!(pixels[[1, 1, 0, 0]], 50);
    }

    #[test]
    fn test_input_tensor_scaling_and_split() {
        let mut pixels = Array4::<u8>::zeros((2, 3, 4, 4));
        pixels[[1, 0, 0, 0]] = 255;

        let tensor = InputTensor::from_pixels(&pixels, false);
        assert_eq!(tensor.shape(), [2, 3, 4, 4]);
        let parts = tensor.split();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].to_f32()[[0, 0, 0, 0]], 1.0);
        assert_eq!(parts[0].shape(), [1, 3, 4, 4]);

        let half = InputTensor::from_pixels(&pixels, true);
        assert!(half.is_half());
        assert_eq!(half.to_f32()[[1, 0, 0, 0]], 1.0);
    }
}
