pub mod scripted;

pub use scripted::{Generation, LifecycleEvent, ScriptedBinding};

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use edgeai_common::ModelDescriptor;
use image::{DynamicImage, RgbImage};

use crate::config::Config;
use crate::images::encode_png;

pub const TEST_MODEL: &str = "test-vision";

pub fn test_config(images_dir: &Path) -> Config {
    let mut model = ModelDescriptor::new(TEST_MODEL);
    model.supports_image = true;

    let mut config = Config::default();
    config.api.host = "127.0.0.1".to_string();
    config.logging.level = "debug".to_string();
    config.inference.timeout_secs = 5;
    config.images.dir = images_dir.to_path_buf();
    config.images.retention_secs = 0;
    config.models = vec![model];
    config
}

/// A solid-color PNG of the given size, base64-encoded.
pub fn sample_png_base64(width: u32, height: u32) -> String {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40])));
    STANDARD.encode(encode_png(&image).expect("Failed to encode PNG"))
}
