//! 学習データの拡張
//!
//! 回転・平行移動・左右反転をランダムに掛けます。画像外の画素は
//! 最も近い端の画素で埋め、サンプリングはバイリニア補間です。

use image::{GrayImage, Luma};
use rand::Rng;

use crate::model::AugmentationSettings;

/// 拡張を1回適用した新しい画像を返す
pub fn augment<R: Rng + ?Sized>(
    img: &GrayImage,
    settings: &AugmentationSettings,
    rng: &mut R,
) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let rotation = symmetric(rng, settings.rotation_degrees).to_radians();
    let shift_x = symmetric(rng, settings.width_shift) * width as f32;
    let shift_y = symmetric(rng, settings.height_shift) * height as f32;
    let flip = settings.horizontal_flip && rng.gen_bool(0.5);

    let (sin, cos) = rotation.sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    GrayImage::from_fn(width, height, |x, y| {
        let x = if flip { width - 1 - x } else { x };

        // 出力画素 -> 元画像の座標（シフトを戻してから逆回転）
        let dx = x as f32 - cx - shift_x;
        let dy = y as f32 - cy - shift_y;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        Luma([sample_bilinear(img, sx, sy)])
    })
}

/// [-range, range] の一様乱数（range <= 0 なら 0）
fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> u8 {
    let (width, height) = img.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p = |px: u32, py: u32| img.get_pixel(px, py)[0] as f32;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    let value = top * (1.0 - fy) + bottom * fy;

    value.round().clamp(0.0, 255.0) as u8
}
