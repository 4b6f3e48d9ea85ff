//! Labeled face images feeding a database reload.
//!
//! A [`DirectorySource`] walks `<root>/<label>/<image>` (or `<root>/<label>.<ext>`
//! for single-image identities) in sorted order. Landmarks come from a sidecar
//! `<stem>.json` holding five `[x, y]` pairs; a 112×112 image without one is
//! taken as an already-aligned crop.

use crate::alignment::{ALIGNED_SIZE, ARCFACE_TEMPLATE_112};
use crate::types::{Frame, LandmarkSet};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid landmarks file {path}: {source}")]
    Landmarks {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One labeled face image.
#[derive(Debug, Clone)]
pub struct EnrollmentSample {
    pub label: String,
    pub frame: Frame,
    /// `None` when no landmarks could be found for the image.
    pub landmarks: Option<LandmarkSet>,
}

/// Supplier of enrollment samples, consumed in order.
pub trait EnrollmentSource {
    /// Next sample, `None` once exhausted. An `Err` concerns that sample only.
    fn next_sample(&mut self) -> Option<Result<EnrollmentSample, EnrollmentError>>;

    /// Consume the rest of the source without loading it, returning the
    /// distinct labels it still held.
    fn drain_labels(&mut self) -> Vec<String>;
}

fn dedup_in_order(labels: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        if !out.contains(&label) {
            out.push(label);
        }
    }
    out
}

/// Load an image from disk with its landmarks.
///
/// Landmarks come from `<stem>.json` next to the image; without it a 112×112
/// image gets the canonical template, anything else gets `None`.
pub fn load_face_image(path: &Path) -> Result<(Frame, Option<LandmarkSet>), EnrollmentError> {
    let img = image::open(path)
        .map_err(|source| EnrollmentError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let frame = Frame::from(img);

    let sidecar = path.with_extension("json");
    let landmarks = if sidecar.is_file() {
        let text = std::fs::read_to_string(&sidecar).map_err(|source| EnrollmentError::Io {
            path: sidecar.clone(),
            source,
        })?;
        let points: [[f32; 2]; 5] = serde_json::from_str(&text)
            .map_err(|source| EnrollmentError::Landmarks { path: sidecar, source })?;
        Some(points.map(|[x, y]| (x, y)))
    } else if frame.width() as usize == ALIGNED_SIZE && frame.height() as usize == ALIGNED_SIZE {
        Some(ARCFACE_TEMPLATE_112)
    } else {
        None
    };

    Ok((frame, landmarks))
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, EnrollmentError> {
    let read = std::fs::read_dir(dir).map_err(|source| EnrollmentError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in read {
        let entry = entry.map_err(|source| EnrollmentError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn file_label(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

/// Face images on disk, grouped by identity.
pub struct DirectorySource {
    root: PathBuf,
    pending: VecDeque<(String, PathBuf)>,
}

impl DirectorySource {
    /// Scan `root`. Images are not decoded until they are consumed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, EnrollmentError> {
        let root = root.as_ref().to_path_buf();
        let mut pending = VecDeque::new();

        for path in sorted_entries(&root)? {
            if path.is_dir() {
                let Some(label) = path.file_name().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                for image in sorted_entries(&path)?.into_iter().filter(|p| is_image(p)) {
                    pending.push_back((label.clone(), image));
                }
            } else if is_image(&path) {
                if let Some(label) = file_label(&path) {
                    pending.push_back((label, path));
                }
            }
        }

        tracing::debug!(root = %root.display(), images = pending.len(), "scanned enrollment directory");
        Ok(Self { root, pending })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of images not yet consumed.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Distinct identities still pending, in scan order.
    pub fn labels(&self) -> Vec<String> {
        dedup_in_order(self.pending.iter().map(|(label, _)| label.clone()))
    }
}

impl EnrollmentSource for DirectorySource {
    fn next_sample(&mut self) -> Option<Result<EnrollmentSample, EnrollmentError>> {
        let (label, path) = self.pending.pop_front()?;
        Some(load_face_image(&path).map(|(frame, landmarks)| EnrollmentSample {
            label,
            frame,
            landmarks,
        }))
    }

    fn drain_labels(&mut self) -> Vec<String> {
        dedup_in_order(self.pending.drain(..).map(|(label, _)| label))
    }
}

/// In-memory samples, handed out in insertion order.
#[derive(Debug, Default)]
pub struct VecSource {
    samples: VecDeque<EnrollmentSample>,
}

impl VecSource {
    pub fn new(samples: impl IntoIterator<Item = EnrollmentSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }
}

impl EnrollmentSource for VecSource {
    fn next_sample(&mut self) -> Option<Result<EnrollmentSample, EnrollmentError>> {
        self.samples.pop_front().map(Ok)
    }

    fn drain_labels(&mut self) -> Vec<String> {
        dedup_in_order(self.samples.drain(..).map(|s| s.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_png(path: &Path, size: u32) {
        RgbImage::from_pixel(size, size, image::Rgb([90, 120, 150]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_directory_scan_order_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bob")).unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        write_png(&dir.path().join("bob/1.png"), 112);
        write_png(&dir.path().join("alice/2.png"), 112);
        write_png(&dir.path().join("alice/1.png"), 112);
        write_png(&dir.path().join("carol.png"), 112);
        std::fs::write(dir.path().join("alice/notes.txt"), "not an image").unwrap();

        let source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.labels(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_prealigned_image_gets_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        write_png(&path, 112);

        let (frame, landmarks) = load_face_image(&path).unwrap();
        assert_eq!((frame.width(), frame.height()), (112, 112));
        assert_eq!(landmarks, Some(ARCFACE_TEMPLATE_112));
    }

    #[test]
    fn test_sidecar_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        write_png(&path, 200);
        std::fs::write(
            dir.path().join("alice.json"),
            "[[80,60],[120,60],[100,85],[85,110],[115,110]]",
        )
        .unwrap();

        let (_, landmarks) = load_face_image(&path).unwrap();
        assert_eq!(landmarks.unwrap()[2], (100.0, 85.0));
    }

    #[test]
    fn test_unaligned_without_sidecar_has_no_landmarks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        write_png(&path, 64);
        let (_, landmarks) = load_face_image(&path).unwrap();
        assert!(landmarks.is_none());
    }

    #[test]
    fn test_bad_sidecar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.png");
        write_png(&path, 112);
        std::fs::write(dir.path().join("alice.json"), "[[1,2]]").unwrap();
        assert!(matches!(
            load_face_image(&path),
            Err(EnrollmentError::Landmarks { .. })
        ));
    }

    #[test]
    fn test_drain_labels_dedups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        write_png(&dir.path().join("alice/1.png"), 112);
        write_png(&dir.path().join("alice/2.png"), 112);
        write_png(&dir.path().join("bob.png"), 112);

        let mut source = DirectorySource::open(dir.path()).unwrap();
        let first = source.next_sample().unwrap().unwrap();
        assert_eq!(first.label, "alice");
        assert_eq!(source.drain_labels(), vec!["alice", "bob"]);
        assert!(source.next_sample().is_none());
    }
}
