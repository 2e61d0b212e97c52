//! Generated image payloads.
//!
//! The image routes serve deterministic PNG gradients rendered on first use.

use std::io::Cursor;

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::server::ServerError;

/// Renders a `size` x `size` RGB gradient as PNG.
pub fn render_png(size: u32) -> Result<Vec<u8>, ServerError> {
    let edge = size.max(1);
    let scale = |v: u32| ((v as u64 * 255) / edge as u64) as u8;
    let image = RgbImage::from_fn(edge, edge, |x, y| Rgb([scale(x), scale(y), 255 - scale((x + y) / 2)]));

    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// The two images, rendered lazily and cached.
#[derive(Debug)]
pub struct ImageAssets {
    small_size: u32,
    large_size: u32,
    small: OnceCell<Bytes>,
    large: OnceCell<Bytes>,
}

impl ImageAssets {
    pub fn new(small_size: u32, large_size: u32) -> Self {
        Self {
            small_size,
            large_size,
            small: OnceCell::new(),
            large: OnceCell::new(),
        }
    }

    pub async fn small(&self) -> Result<Bytes, ServerError> {
        Self::load(&self.small, self.small_size).await
    }

    pub async fn large(&self) -> Result<Bytes, ServerError> {
        Self::load(&self.large, self.large_size).await
    }

    async fn load(cell: &OnceCell<Bytes>, size: u32) -> Result<Bytes, ServerError> {
        cell.get_or_try_init(|| async move {
            debug!(size, "Rendering PNG");
            let png = tokio::task::spawn_blocking(move || render_png(size)).await??;
            Ok(Bytes::from(png))
        })
        .await
        .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    #[test]
    fn renders_png() {
        let png = render_png(8).unwrap();
        assert!(png.starts_with(PNG_MAGIC));
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render_png(16).unwrap(), render_png(16).unwrap());
    }

    #[tokio::test]
    async fn caches_rendered_bytes() {
        let assets = ImageAssets::new(4, 32);
        let first = assets.small().await.unwrap();
        let second = assets.small().await.unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert!(assets.large().await.unwrap().len() > first.len());
    }
}
