// Pre-flight checks on the destination before a download is accepted

use std::fs;
use std::path::Path;

use super::errors::ValidationFailure;

const WRITE_PROBE: &str = ".write_test";

/// Check that `target` can be written inside `folder`.
///
/// Creates the folder when missing, proves it is writable with a marker file,
/// refuses to overwrite an existing target and requires `min_free_bytes` of
/// free space on the volume.
pub fn validate_destination(
    folder: &Path,
    target: &Path,
    min_free_bytes: u64,
) -> Result<(), ValidationFailure> {
    if !folder.exists() {
        fs::create_dir_all(folder).map_err(|e| {
            tracing::warn!("[Validator] Cannot create {}: {}", folder.display(), e);
            ValidationFailure::CannotCreateFolder(e.to_string())
        })?;
    }

    let probe = folder.join(WRITE_PROBE);
    let writable = fs::write(&probe, b"test").and_then(|_| fs::remove_file(&probe));
    if let Err(e) = writable {
        tracing::warn!("[Validator] {} is not writable: {}", folder.display(), e);
        let _ = fs::remove_file(&probe);
        return Err(ValidationFailure::NoWritePermission);
    }

    if target.exists() {
        return Err(ValidationFailure::FileAlreadyExists);
    }

    if min_free_bytes > 0 {
        match fs2::available_space(folder) {
            Ok(available) if available < min_free_bytes => {
                return Err(ValidationFailure::NotEnoughDiskSpace {
                    available,
                    required: min_free_bytes,
                });
            }
            Ok(_) => {}
            // Unknown free space does not block the download
            Err(e) => tracing::debug!("[Validator] Free space unavailable: {}", e),
        }
    }

    Ok(())
}
