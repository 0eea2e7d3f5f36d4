use std::path::{Path, PathBuf};

use crate::error::{CaptionError, CaptionResult};

/// File-backed image reader used while fine-tuning.
///
/// Decodes PNG/JPEG/BMP/GIF files under `root`, resizes them to
/// `side × side`, and flattens as R, G, B, ... normalized to [0, 1].
/// Once closed, every further read fails.
#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    side: u32,
    open: bool,
}

impl ImageStore {
    pub fn open(root: impl Into<PathBuf>, side: usize) -> CaptionResult<ImageStore> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CaptionError::resource(format!(
                "image directory '{}' does not exist",
                root.display()
            )));
        }
        Ok(ImageStore { root, side: side as u32, open: true })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns a flat `Vec<f64>` of length `side * side * 3`.
    pub fn load_rgb(&self, relative: &Path) -> CaptionResult<Vec<f64>> {
        if !self.open {
            return Err(CaptionError::resource("image store already closed"));
        }
        let path = self.root.join(relative);
        let bytes = std::fs::read(&path).map_err(|e| {
            CaptionError::resource(format!("cannot read image '{}': {e}", path.display()))
        })?;
        image_bytes_to_rgb_input(&bytes, self.side, self.side)
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}

pub fn image_bytes_to_rgb_input(bytes: &[u8], width: u32, height: u32) -> CaptionResult<Vec<f64>> {
    let img = image::load_from_memory(bytes)?;
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();
    Ok(rgb.pixels().flat_map(|p| p.0.iter().map(|&c| c as f64 / 255.0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn loads_resizes_and_refuses_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(8, 8, Rgb([255, 0, 51]));
        img.save(dir.path().join("red.png")).unwrap();

        let mut store = ImageStore::open(dir.path(), 4).unwrap();
        let pixels = store.load_rgb(Path::new("red.png")).unwrap();
        assert_eq!(pixels.len(), 4 * 4 * 3);
        assert!((pixels[0] - 1.0).abs() < 1e-9);
        assert!((pixels[2] - 0.2).abs() < 1e-9);

        store.close();
        assert!(!store.is_open());
        assert!(matches!(
            store.load_rgb(Path::new("red.png")),
            Err(CaptionError::Resource(_))
        ));
    }

    #[test]
    fn missing_directory_is_a_resource_error() {
        assert!(ImageStore::open("/definitely/not/here", 4).is_err());
    }
}
