use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::{debug, info};

use fabriclab_api::error::{
    EnvironmentError, FabricError, ImageNotFoundError, InternalError, ReportError,
};

/// A disk image that could be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl ImageCandidate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Lists the files in `dir` matching the glob `pattern`, in glob order.
pub fn list_candidates(dir: &Path, pattern: &str) -> Result<Vec<ImageCandidate>, FabricError> {
    if !dir.is_dir() {
        return Err(FabricError::new(EnvironmentError::MissingDirectory {
            path: dir.display().to_string(),
        }));
    }

    let full_pattern = Path::new(&glob::Pattern::escape(&dir.to_string_lossy())).join(pattern);
    let paths = glob::glob(&full_pattern.to_string_lossy())
        .structured(InternalError::Internal("Invalid image pattern"))?;

    let mut candidates = Vec::new();
    for path in paths.flatten() {
        let Ok(metadata) = path.metadata() else {
            debug!("Skipping unreadable image candidate '{}'", path.display());
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        candidates.push(ImageCandidate {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        });
    }

    Ok(candidates)
}

/// Returns the first candidate whose file name contains `version`.
pub fn find_version<'c>(
    candidates: &'c [ImageCandidate],
    version: &str,
) -> Result<&'c ImageCandidate, ImageNotFoundError> {
    candidates
        .iter()
        .find(|candidate| candidate.file_name().contains(version))
        .ok_or_else(|| ImageNotFoundError::VersionNotFound {
            version: version.to_string(),
            available: candidates.iter().map(ImageCandidate::file_name).collect(),
        })
}

/// Returns the most recently modified candidate, the earliest listed one on
/// ties.
pub fn newest(candidates: &[ImageCandidate]) -> Option<&ImageCandidate> {
    candidates.iter().reduce(|newest, candidate| {
        if candidate.modified > newest.modified {
            candidate
        } else {
            newest
        }
    })
}

/// Locates the image to install in `dir`.
pub fn resolve_image(
    dir: &Path,
    pattern: &str,
    version: Option<&str>,
) -> Result<PathBuf, FabricError> {
    let candidates = list_candidates(dir, pattern)?;
    let Some(latest) = newest(&candidates) else {
        return Err(FabricError::new(ImageNotFoundError::NoImages {
            directory: dir.display().to_string(),
            pattern: pattern.to_string(),
        }));
    };

    let selected = match version {
        Some(version) => {
            let found = find_version(&candidates, version).map_err(FabricError::new)?;
            info!("Found requested version: {}", found.file_name());
            found
        }
        None => {
            info!("Using newest image: {}", latest.file_name());
            latest
        }
    };

    Ok(selected.path.clone())
}
