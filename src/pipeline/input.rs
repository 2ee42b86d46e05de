//! Page discovery and decoding.
//!
//! Pages are the image files directly inside `input_dir` whose extension is
//! in `image_extensions`, ordered by file name. Zero-padded names
//! (`page-001.jpg`, `page-002.jpg`, …) therefore sort in reading order.
//! Outputs and cache entries are keyed by file stem, so only the first file
//! (by name) of each stem is kept.

use crate::config::PipelineConfig;
use crate::error::{PageError, ScribeError};
use crate::model::{page_stem, PageImage};
use image::DynamicImage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// List the page images of the run in processing order.
pub async fn discover_pages(config: &PipelineConfig) -> Result<Vec<PageImage>, ScribeError> {
    let dir = &config.input_dir;
    if !dir.is_dir() {
        return Err(ScribeError::InputDirNotFound { path: dir.clone() });
    }

    let unreadable = |source| ScribeError::InputDirUnreadable {
        path: dir.clone(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(unreadable)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        let Ok(name) = entry.file_name().into_string() else {
            debug!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && config.is_page_image(&name) {
            names.push(name);
        }
    }
    names.sort();

    let mut stems = HashSet::new();
    names.retain(|name| {
        let fresh = stems.insert(page_stem(name).to_string());
        if !fresh {
            warn!(
                "Ignoring {name}: another page image with stem '{}' comes first",
                page_stem(name)
            );
        }
        fresh
    });

    info!("Found {} page images in {}", names.len(), dir.display());
    Ok(names
        .into_iter()
        .enumerate()
        .map(|(position, id)| PageImage {
            path: dir.join(&id),
            id,
            position,
        })
        .collect())
}

/// List the Markdown files below `root`, as paths relative to it, sorted.
/// The `exclude` directory is not descended into.
pub async fn discover_markdown(root: &Path, exclude: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if path != exclude {
                    pending.push(path);
                }
            } else if file_type.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
            {
                if let Ok(relative) = path.strip_prefix(root) {
                    found.push(relative.to_path_buf());
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Decode a page image. Runs on the blocking pool since decoding is CPU-bound.
pub async fn load_page(page: &PageImage) -> Result<DynamicImage, PageError> {
    let path = page.path.clone();
    let decoded = tokio::task::spawn_blocking(move || image::open(&path))
        .await
        .map_err(|e| PageError::Input {
            page: page.id.clone(),
            detail: format!("decode task panicked: {e}"),
        })?;
    let img = decoded.map_err(|e| PageError::Input {
        page: page.id.clone(),
        detail: e.to_string(),
    })?;
    debug!("Decoded {} ({}x{})", page.id, img.width(), img.height());
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[tokio::test]
    async fn discovers_sorted_images_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page-010.png", "page-002.jpg", "page-001.JPEG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let config = PipelineConfig::builder().input_dir(dir.path()).build().unwrap();
        let pages = discover_pages(&config).await.unwrap();
        let ids: Vec<_> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["page-001.JPEG", "page-002.jpg", "page-010.png"]);
        assert_eq!(pages[2].position, 2);
        assert_eq!(pages[2].stem(), "page-010");
    }

    #[tokio::test]
    async fn duplicate_stems_keep_first_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page-001.png", "page-001.jpg", "page-002.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let config = PipelineConfig::builder().input_dir(dir.path()).build().unwrap();
        let pages = discover_pages(&config).await.unwrap();
        let ids: Vec<_> = pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["page-001.jpg", "page-002.png"]);
        assert_eq!(pages[1].position, 1);
    }

    #[tokio::test]
    async fn markdown_discovery_recurses_and_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("part2")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        for name in ["b.md", "a.md", "part2/c.MD", "notes.txt", "out/a.md"] {
            std::fs::write(root.join(name), b"x").unwrap();
        }

        let files = discover_markdown(root, &root.join("out")).await.unwrap();
        assert_eq!(
            files,
            [
                PathBuf::from("a.md"),
                PathBuf::from("b.md"),
                PathBuf::from("part2/c.MD")
            ]
        );
    }

    #[tokio::test]
    async fn missing_input_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .input_dir(dir.path().join("absent"))
            .build()
            .unwrap();
        let err = discover_pages(&config).await.unwrap_err();
        assert!(matches!(err, ScribeError::InputDirNotFound { .. }));
    }

    #[tokio::test]
    async fn undecodable_image_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        RgbImage::from_pixel(4, 3, Rgb([1, 2, 3])).save(&good).unwrap();
        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"definitely not a jpeg").unwrap();

        let page = |id: &str, path| PageImage {
            id: id.into(),
            path,
            position: 0,
        };
        let img = load_page(&page("good.png", good)).await.unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));

        let err = load_page(&page("bad.jpg", bad)).await.unwrap_err();
        assert!(matches!(err, PageError::Input { .. }));
        assert_eq!(err.page(), "bad.jpg");
    }
}
