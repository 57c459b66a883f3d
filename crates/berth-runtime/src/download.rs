use crate::progress::{ProgressEvent, ProgressSink};
use crate::RuntimeError;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path};
use std::time::Duration;
use tracing::{debug, info};

pub const ENGINE_ARCHIVE_URL: &str =
    "https://download.docker.com/linux/static/stable/x86_64/docker-27.5.1.tgz";
pub const COMPOSE_BINARY_URL: &str =
    "https://github.com/docker/compose/releases/download/v2.33.1/docker-compose-linux-x86_64";

/// Top-level directory inside the engine archive.
const ARCHIVE_PREFIX: &str = "docker";
const CHUNK_SIZE: usize = 256 * 1024;
const MIB: f64 = 1_048_576.0;

pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest`, replacing it atomically. Returns bytes written.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<u64, RuntimeError>;
}

pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn download_error(url: &str, detail: impl ToString) -> RuntimeError {
    RuntimeError::Download {
        url: url.to_owned(),
        detail: detail.to_string(),
    }
}

impl Downloader for HttpDownloader {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<u64, RuntimeError> {
        info!("downloading {url}");
        let resp = match self
            .agent
            .get(url)
            .header("User-Agent", concat!("berth/", env!("CARGO_PKG_VERSION")))
            .call()
        {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(download_error(url, format!("HTTP {code}")));
            }
            Err(e) => return Err(download_error(url, e)),
        };
        let total: u64 = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let dir = dest.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut reader = resp.into_body().into_reader();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut done: u64 = 0;
        let mut last_pct: Option<u8> = None;
        loop {
            let n = reader.read(&mut buf).map_err(|e| download_error(url, e))?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])?;
            done += n as u64;
            if total > 0 {
                let pct = ((done * 100) / total).min(100) as u8;
                if last_pct != Some(pct) {
                    progress.emit(&ProgressEvent::new(
                        pct,
                        format!(
                            "{label}: {:.1}/{:.1} MB",
                            done as f64 / MIB,
                            total as f64 / MIB
                        ),
                    ));
                    last_pct = Some(pct);
                }
            }
        }
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| RuntimeError::Io(e.error))?;
        info!(
            "downloaded {:.1} MB -> {}",
            done as f64 / MIB,
            dest.display()
        );
        Ok(done)
    }
}

/// Unpack the engine `.tgz` into `dest`, dropping the archive's `docker/`
/// prefix. Returns the number of entries written.
pub fn extract_engine_archive(archive: &Path, dest: &Path) -> Result<usize, RuntimeError> {
    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    fs::create_dir_all(dest)?;
    let mut count = 0;
    for entry in tar
        .entries()
        .map_err(|e| RuntimeError::Provisioning(format!("corrupt engine archive: {e}")))?
    {
        let mut entry = entry
            .map_err(|e| RuntimeError::Provisioning(format!("corrupt engine archive: {e}")))?;
        let path = entry.path()?.into_owned();
        let Ok(rel) = path.strip_prefix(ARCHIVE_PREFIX) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(RuntimeError::Provisioning(format!(
                "refusing archive entry outside install root: {}",
                path.display()
            )));
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!("extract {}", rel.display());
        entry
            .unpack(&target)
            .map_err(|e| RuntimeError::Provisioning(format!("extract {}: {e}", rel.display())))?;
        count += 1;
    }
    Ok(count)
}

pub fn make_executable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    /// Build a gzipped tar holding `entries` (path, contents).
    pub(crate) fn tgz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn strips_archive_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("docker.tgz");
        fs::write(
            &archive,
            tgz(&[
                ("docker/docker", b"cli"),
                ("docker/dockerd", b"daemon"),
                ("docker/containerd", b"c"),
                ("README", b"ignored"),
            ]),
        )
        .unwrap();
        let dest = dir.path().join("install");
        let n = extract_engine_archive(&archive, &dest).unwrap();
        assert_eq!(n, 3);
        assert_eq!(fs::read(dest.join("dockerd")).unwrap(), b"daemon");
        assert!(dest.join("containerd").exists());
        assert!(!dest.join("README").exists());
        assert!(!dest.join("docker").join("dockerd").exists());
    }

    #[test]
    fn corrupt_archive_is_a_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("docker.tgz");
        fs::write(&archive, b"this is not gzip").unwrap();
        let err = extract_engine_archive(&archive, dir.path()).unwrap_err();
        assert!(matches!(err, RuntimeError::Provisioning(_)));
    }

    #[cfg(unix)]
    #[test]
    fn make_executable_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("bin");
        fs::write(&f, b"#!/bin/sh\n").unwrap();
        make_executable(&f).unwrap();
        assert_eq!(fs::metadata(&f).unwrap().permissions().mode() & 0o111, 0o111);
    }
}
