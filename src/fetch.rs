use crate::error::FixError;
use reqwest::header::{CACHE_CONTROL, PRAGMA, USER_AGENT};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CHUNK_SIZE: usize = 64 * 1024;

/// Fetches the installer artifact into a uniquely named temporary file.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(f64),
        on_log: &mut dyn FnMut(&str),
    ) -> Result<PathBuf, FixError>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    user_agent: String,
    temp_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, FixError> {
        let client = reqwest::blocking::Client::builder()
            // Installers are large; only connecting is bounded.
            .timeout(Option::<Duration>::None)
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            temp_dir: std::env::temp_dir(),
        })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(f64),
        on_log: &mut dyn FnMut(&str),
    ) -> Result<PathBuf, FixError> {
        on_log("Downloading latest Zoom package...");
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FixError::DownloadFailed {
                status_code: status.as_u16(),
            });
        }
        let expected = response.content_length();
        let path = download_to_temp(response, expected, &self.temp_dir, on_progress)?;
        on_log(&format!("Installer saved to {}", path.display()));
        Ok(path)
    }
}

/// Streams `body` into a fresh `ZoomInstaller-*.pkg` file under `dir`. The
/// partial file is removed if streaming fails.
pub fn download_to_temp<R: Read>(
    body: R,
    expected: Option<u64>,
    dir: &Path,
    on_progress: &mut dyn FnMut(f64),
) -> Result<PathBuf, FixError> {
    let mut file = tempfile::Builder::new()
        .prefix("ZoomInstaller-")
        .suffix(".pkg")
        .tempfile_in(dir)?;
    stream_with_progress(body, expected, file.as_file_mut(), on_progress)?;
    let (_, path) = file.keep().map_err(|err| FixError::Io(err.error))?;
    Ok(path)
}

/// Copies `body` into `dest` chunk by chunk. With a known positive size,
/// progress is reported after every chunk as `received / expected`, capped at
/// 1.0; otherwise only the final 1.0 is reported. Returns bytes written.
pub fn stream_with_progress<R: Read>(
    mut body: R,
    expected: Option<u64>,
    dest: &mut File,
    on_progress: &mut dyn FnMut(f64),
) -> Result<u64, FixError> {
    let expected = expected.filter(|size| *size > 0);
    let mut writer = BufWriter::new(dest);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    let mut last_reported = 0.0_f64;

    loop {
        let read = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FixError::Io(err)),
        };
        writer.write_all(&buf[..read])?;
        received += read as u64;

        if let Some(total) = expected {
            let fraction = (received as f64 / total as f64).min(1.0);
            if fraction > last_reported {
                last_reported = fraction;
                on_progress(fraction);
            }
        }
    }
    writer.flush()?;

    if last_reported < 1.0 {
        on_progress(1.0);
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// Yields the body in fixed-size pieces, one per read call.
    struct ChunkedBody {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for ChunkedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    struct FailingBody {
        served: bool,
    }

    impl Read for FailingBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.served = true;
            buf[..4].copy_from_slice(b"xar!");
            Ok(4)
        }
    }

    fn chunks(count: usize, size: usize) -> ChunkedBody {
        ChunkedBody {
            chunks: (0..count).map(|i| vec![i as u8; size]).collect(),
        }
    }

    #[test]
    fn four_quarters_report_exact_progress() {
        let dir = tempdir().unwrap();
        let mut reports = Vec::new();
        let path = download_to_temp(chunks(4, 250), Some(1000), dir.path(), &mut |p| {
            reports.push(p)
        })
        .expect("download");
        assert_eq!(reports, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 1000);
    }

    #[test]
    fn unknown_size_reports_only_completion() {
        let dir = tempdir().unwrap();
        let mut reports = Vec::new();
        download_to_temp(chunks(3, 100), None, dir.path(), &mut |p| reports.push(p))
            .expect("download");
        assert_eq!(reports, vec![1.0]);
    }

    #[test]
    fn zero_expected_size_is_treated_as_unknown() {
        let dir = tempdir().unwrap();
        let mut reports = Vec::new();
        download_to_temp(chunks(2, 10), Some(0), dir.path(), &mut |p| reports.push(p))
            .expect("download");
        assert_eq!(reports, vec![1.0]);
    }

    #[test]
    fn progress_is_monotonic_and_capped_when_body_overruns() {
        let dir = tempdir().unwrap();
        let mut reports = Vec::new();
        download_to_temp(chunks(5, 300), Some(1000), dir.path(), &mut |p| {
            reports.push(p)
        })
        .expect("download");
        assert!(reports.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(reports.last().copied(), Some(1.0));
        assert!(reports.iter().all(|p| *p <= 1.0));
    }

    #[test]
    fn short_body_still_finishes_at_one() {
        let dir = tempdir().unwrap();
        let mut reports = Vec::new();
        download_to_temp(chunks(1, 500), Some(1000), dir.path(), &mut |p| {
            reports.push(p)
        })
        .expect("download");
        assert_eq!(reports, vec![0.5, 1.0]);
    }

    #[test]
    fn each_download_gets_a_unique_file() {
        let dir = tempdir().unwrap();
        let first = download_to_temp(chunks(1, 8), None, dir.path(), &mut |_| {}).unwrap();
        let second = download_to_temp(chunks(1, 8), None, dir.path(), &mut |_| {}).unwrap();
        assert_ne!(first, second);
        for path in [&first, &second] {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("ZoomInstaller-"));
            assert!(name.ends_with(".pkg"));
        }
    }

    #[test]
    fn failed_stream_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let err = download_to_temp(FailingBody { served: false }, Some(8), dir.path(), &mut |_| {})
            .expect_err("reset");
        assert!(matches!(err, FixError::Io(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
