//! Persists generated images under deterministic names.

use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::api::GeneratedImage;
use crate::constants::BATCH_REPORT_FILENAME;
use crate::error::GenerationError;
use crate::report::BatchReport;
use crate::scheduler::{Operation, Scene, VariationSpec};

/// `{scene_stem}_{op}_{index}.{ext}`, keeping the scene's extension.
pub fn output_name(scene: &Scene, operation: Operation, index: u32) -> String {
    format!(
        "{}_{}_{}.{}",
        scene.stem(),
        operation.tag(),
        index,
        scene.extension()
    )
}

/// Converts the returned image into `format`, passing bytes through when they already match.
pub fn encode_as(image: &GeneratedImage, format: ImageFormat) -> Result<Vec<u8>, GenerationError> {
    let source = image::guess_format(&image.bytes).map_err(|err| {
        GenerationError::MalformedResponse(format!("generated bytes are not an image: {err}"))
    })?;
    if source == format {
        return Ok(image.bytes.clone());
    }

    let decoded = image::load_from_memory_with_format(&image.bytes, source).map_err(|err| {
        GenerationError::MalformedResponse(format!("failed to decode generated image: {err}"))
    })?;
    // JPEG has no alpha channel.
    let decoded = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(decoded.to_rgb8())
    } else {
        decoded
    };

    let mut output = Cursor::new(Vec::new());
    decoded.write_to(&mut output, format)?;
    debug!("Re-encoded generated image from {:?} to {:?}", source, format);
    Ok(output.into_inner())
}

/// Writes `bytes` to `path`, creating parent directories. Refuses to replace an
/// existing file unless `overwrite` is set.
pub async fn write_file(path: &Path, bytes: &[u8], overwrite: bool) -> Result<(), GenerationError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            GenerationError::Io(format!("failed to create {}: {err}", parent.display()))
        })?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut file = match options.open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(GenerationError::Collision(path.to_path_buf()));
        }
        Err(err) => {
            return Err(GenerationError::Io(format!(
                "failed to open {}: {err}",
                path.display()
            )));
        }
    };
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Writes a generated image to an explicit path, converting it to the format
/// implied by the extension. Unknown extensions get the raw bytes.
pub async fn save_image(
    path: &Path,
    image: &GeneratedImage,
    overwrite: bool,
) -> Result<(), GenerationError> {
    let bytes = match ImageFormat::from_path(path) {
        Ok(format) => encode_as(image, format)?,
        Err(_) => image.bytes.clone(),
    };
    write_file(path, &bytes, overwrite).await?;
    info!("Generated image saved to: {}", path.display());
    Ok(())
}

/// The only place batch results touch the filesystem.
#[derive(Clone, Debug)]
pub struct OutputWriter {
    dir: PathBuf,
    overwrite: bool,
}

impl OutputWriter {
    /// Writes into `dir`; existing files are replaced only when `overwrite` is set.
    pub fn new(dir: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            dir: dir.into(),
            overwrite,
        }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the job's image goes.
    pub fn path_for(&self, spec: &VariationSpec) -> PathBuf {
        self.dir
            .join(output_name(&spec.scene, spec.operation(), spec.output_index))
    }

    /// Persists the image for one job in its scene's format.
    pub async fn write(
        &self,
        spec: &VariationSpec,
        image: &GeneratedImage,
    ) -> Result<PathBuf, GenerationError> {
        let path = self.path_for(spec);
        let bytes = match spec.scene.format() {
            Some(format) => encode_as(image, format)?,
            None => image.bytes.clone(),
        };
        write_file(&path, &bytes, self.overwrite).await?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Writes `batch_report.json` next to the images, always replacing an older one.
    pub async fn write_report(&self, report: &BatchReport) -> Result<PathBuf, GenerationError> {
        let path = self.dir.join(BATCH_REPORT_FILENAME);
        let json = serde_json::to_vec_pretty(&report.file())
            .map_err(|err| GenerationError::Io(format!("failed to serialize report: {err}")))?;
        write_file(&path, &json, true).await?;
        Ok(path)
    }
}
