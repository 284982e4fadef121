//! Still images as frame sources, and writing frames back to image files.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, ShaderError};
use crate::frame::{FrameBuffer, FrameInfo, Precision};
use crate::pipeline::FrameSource;

/// An image file decoded once and served for every frame.
#[derive(Debug, Clone)]
pub struct ImageSource {
    path: PathBuf,
    frame: FrameBuffer,
}

impl ImageSource {
    pub fn open(path: impl AsRef<Path>, precision: Precision) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|e| image_error(path, e))?
            .to_rgba8();
        info!(path = %path.display(), width = image.width(), height = image.height(), "image loaded");
        Ok(Self {
            path: path.to_path_buf(),
            frame: FrameBuffer::from_rgba_image(&image, precision),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for ImageSource {
    fn info(&self) -> FrameInfo {
        self.frame.info()
    }

    fn get_frame(&self, _n: u64) -> Result<FrameBuffer> {
        Ok(self.frame.clone())
    }
}

/// Writes `frame` as an 8-bit RGBA image; the format follows the file
/// extension.
pub fn save_frame(frame: &FrameBuffer, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    frame
        .to_rgba_image()?
        .save(path)
        .map_err(|e| image_error(path, e))
}

fn image_error(path: &Path, err: image::ImageError) -> ShaderError {
    match err {
        image::ImageError::IoError(err) => ShaderError::Io(err),
        other => ShaderError::FrameMismatch(format!("{}: {other}", path.display())),
    }
}
