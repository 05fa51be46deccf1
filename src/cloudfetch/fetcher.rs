use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::trace;

use crate::protocol::{FileReference, TransportError};

/// Performs the plain GET against a pre-signed link. No credentials are added; the url
/// carries its own authorization.
pub trait FileFetcher: Send + Sync {
    fn fetch(&self, reference: &FileReference) -> Result<Vec<u8>, TransportError>;
}

/// Serves `file://` links of the form `file:///abs/path?expires=<unix-ms>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileFetcher;

pub fn file_url(path: &Path, expires_at_ms: u64) -> String {
    format!("file://{}?expires={expires_at_ms}", path.display())
}

fn parse_file_url(url: &str) -> Option<(PathBuf, Option<u64>)> {
    let rest = url.strip_prefix("file://")?;
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    let expires = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "expires")
            .and_then(|(_, v)| v.parse::<u64>().ok())
    });
    Some((PathBuf::from(path), expires))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl FileFetcher for LocalFileFetcher {
    fn fetch(&self, reference: &FileReference) -> Result<Vec<u8>, TransportError> {
        let (path, expires) =
            parse_file_url(&reference.url).ok_or_else(|| TransportError::Status {
                status: 400,
                retry_after: None,
                message: format!("unsupported url '{}'", reference.url),
            })?;

        if expires.is_some_and(|at| at <= now_ms()) {
            return Err(TransportError::LinkExpired {
                url: reference.url.clone(),
            });
        }

        trace!("reading staged file {}", path.display());
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransportError::Status {
                status: 404,
                retry_after: None,
                message: format!("{} not found", path.display()),
            },
            io::ErrorKind::PermissionDenied => TransportError::Status {
                status: 403,
                retry_after: None,
                message: format!("access to {} denied", path.display()),
            },
            _ => TransportError::Io(e),
        })
    }
}
