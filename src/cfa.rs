//! CFA aggregation index files.

use crate::error::PadoccError;

use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// A writer of CFA aggregation files.
pub trait CfaBackend: fmt::Debug + Send + Sync {
    /// Index `files` into a CFA file at `path`.
    fn create(&self, files: &[String], path: &Path) -> Result<(), PadoccError>;
}

/// Create a CFA file when a backend is available.
///
/// Returns whether a CFA file was written. Backend failures are logged and reported as
/// `false`.
pub fn cfa_handler(
    backend: Option<&dyn CfaBackend>,
    files: &[String],
    path: &Path,
    dryrun: bool,
) -> bool {
    let Some(backend) = backend else {
        return false;
    };
    if dryrun {
        info!("DRYRUN: Skipped creating CFA file {}", path.display());
        return false;
    }
    match backend.create(files, path) {
        Ok(()) => {
            info!("Written CFA file {}", path.display());
            true
        }
        Err(err) => {
            warn!("CFA creation failed: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::ListingCfa;

    #[test]
    fn no_backend() {
        assert!(!cfa_handler(None, &[], Path::new("/tmp/x.nca"), false));
    }

    #[test]
    fn backend_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p1.nca");
        let files = vec!["/a.nc".to_string(), "/b.nc".to_string()];
        assert!(cfa_handler(Some(&ListingCfa), &files, &path, false));
        assert_eq!("/a.nc\n/b.nc", std::fs::read_to_string(&path).unwrap());
        let other = dir.path().join("p2.nca");
        assert!(!cfa_handler(Some(&ListingCfa), &files, &other, true));
        assert!(!other.exists());
    }

    #[test]
    fn backend_failure() {
        let files = vec!["/a.nc".to_string()];
        assert!(!cfa_handler(
            Some(&ListingCfa),
            &files,
            Path::new("/no/such/dir/p1.nca"),
            false
        ));
    }
}
