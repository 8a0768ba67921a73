//! The fetcher adapter: a byte-oriented resource opener supporting ranged requests.
//!
//! The demuxer core talks to the network through the [`ResourceOpener`] trait so that tests can
//! substitute a scripted opener. [`DefaultOpener`] implements it over a blocking reqwest client
//! (HTTP and HTTPS, with a cookie store so that Set-Cookie responses are replayed on subsequent
//! requests) and over local files, restricted to a configurable extension allowlist.

use crate::{DashDemuxError, DemuxOptions};
use backoff::{retry, ExponentialBackoff};
use reqwest::header::RANGE;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::{trace, warn};
use url::Url;


/// Hard upper bound on the size of a manifest document.
pub(crate) const MAX_MANIFEST_SIZE: usize = 50 * 1024;
/// Initial allocation when reading a manifest document.
pub(crate) const INITIAL_MANIFEST_BUFFER: usize = 8 * 1024;

/// A blocking `Client` from the `reqwest` crate, that we use to download content over HTTP.
pub type HttpClient = reqwest::blocking::Client;

/// An open byte stream over one resource (or one byte range of it).
pub struct ByteSource {
    reader: Box<dyn Read + Send>,
    /// Size in bytes of the opened resource or range, -1 when the transport could not tell.
    pub size: i64,
}

impl ByteSource {
    pub fn new(reader: Box<dyn Read + Send>, size: i64) -> ByteSource {
        ByteSource { reader, size }
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

/// The seam through which the demuxer reaches the network (or a test double). `offset` and
/// `end_offset` delimit a byte range; `end_offset == -1` means "to the end of the resource".
pub trait ResourceOpener {
    fn open_resource(&self, url: &Url, offset: i64, end_offset: i64)
                     -> Result<ByteSource, DashDemuxError>;

    /// Fetch a manifest document, enforcing the manifest size cap. Returns the document text and
    /// the final URL after any redirects.
    fn fetch_document(&self, url: &Url) -> Result<(String, Url), DashDemuxError>;
}


// Decide whether a failed manifest request is worth retrying: timeouts and the usual
// overload or rate-limit statuses are transient, anything else is final.
fn categorize_reqwest_error(e: reqwest::Error) -> backoff::Error<reqwest::Error> {
    use reqwest::StatusCode;

    let transient = e.is_timeout()
        || matches!(e.status(),
                    Some(StatusCode::REQUEST_TIMEOUT
                         | StatusCode::TOO_MANY_REQUESTS
                         | StatusCode::SERVICE_UNAVAILABLE
                         | StatusCode::GATEWAY_TIMEOUT));
    if transient {
        backoff::Error::retry_after(e, Duration::new(5, 0))
    } else {
        backoff::Error::permanent(e)
    }
}

fn network_error(why: &str, e: reqwest::Error) -> DashDemuxError {
    if e.is_timeout() {
        DashDemuxError::NetworkTimeout(format!("{why}: {e:?}"))
    } else if e.is_connect() {
        DashDemuxError::NetworkConnect(format!("{why}: {e:?}"))
    } else {
        DashDemuxError::Network(format!("{why}: {e:?}"))
    }
}

fn unwrap_backoff(e: backoff::Error<reqwest::Error>) -> reqwest::Error {
    match e {
        backoff::Error::Permanent(e) => e,
        backoff::Error::Transient { err, .. } => err,
    }
}

// Read at most the manifest cap; exceeding it is treated as a bogus manifest rather than an
// invitation to allocate.
fn read_manifest_capped(r: impl Read, url: &Url) -> Result<String, DashDemuxError> {
    let mut buf = Vec::with_capacity(INITIAL_MANIFEST_BUFFER);
    r.take(MAX_MANIFEST_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(|e| DashDemuxError::Io(e, format!("reading manifest from {url}")))?;
    if buf.len() > MAX_MANIFEST_SIZE {
        return Err(DashDemuxError::InvalidManifest(
            format!("manifest {url} exceeds {MAX_MANIFEST_SIZE} bytes")));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}


/// Opener over HTTP(S) and local files. A `crypto+http(s)` URL is passed through by stripping
/// the prefix (the decrypting transport is the caller's concern).
pub struct DefaultOpener {
    client: HttpClient,
    allowed_extensions: String,
    referer: Option<String>,
}

impl DefaultOpener {
    pub fn new(options: &DemuxOptions) -> Result<DefaultOpener, DashDemuxError> {
        let client = HttpClient::builder()
            .user_agent(concat!("dash-demux/", env!("CARGO_PKG_VERSION")))
            .cookie_store(true)
            .timeout(Duration::new(30, 0))
            .build()
            .map_err(|_| DashDemuxError::Network(String::from("building HTTP client")))?;
        Ok(DefaultOpener {
            client,
            allowed_extensions: options.allowed_extensions.clone(),
            referer: None,
        })
    }

    /// Use a caller-supplied reqwest Client (to specify a proxy, request timeouts, additional
    /// root certificates to trust, etc.). Enable its cookie store if session cookies set by the
    /// server should be replayed.
    pub fn with_client(mut self, client: HttpClient) -> DefaultOpener {
        self.client = client;
        self
    }

    /// Specify the value for the Referer HTTP header used in network requests.
    pub fn with_referer(mut self, referer: String) -> DefaultOpener {
        self.referer = Some(referer);
        self
    }

    // The scheme gate: anything other than HTTP(S), allowlisted local files and the crypto
    // passthrough means the manifest is trying to make us open something we shouldn't.
    fn effective_url(&self, url: &Url, check_extension: bool) -> Result<Url, DashDemuxError> {
        let (scheme, url) = match url.scheme().strip_prefix("crypto+") {
            Some(inner) => {
                let stripped = url.as_str().replacen("crypto+", "", 1);
                let inner_url = Url::parse(&stripped)
                    .map_err(|e| DashDemuxError::InvalidManifest(format!("crypto URL: {e}")))?;
                (inner.to_string(), inner_url)
            },
            None => (url.scheme().to_string(), url.clone()),
        };
        match scheme.as_str() {
            "http" | "https" => Ok(url),
            "file" => {
                if check_extension && !self.extension_allowed(&url) {
                    return Err(DashDemuxError::InvalidManifest(
                        format!("filename extension of {url} is not in the allowed list")));
                }
                Ok(url)
            },
            other => Err(DashDemuxError::InvalidManifest(
                format!("unsupported URL scheme {other}"))),
        }
    }

    fn extension_allowed(&self, url: &Url) -> bool {
        if self.allowed_extensions == "ALL" {
            return true;
        }
        let ext = Path::new(url.path())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        self.allowed_extensions
            .split(',')
            .any(|allowed| allowed.trim().eq_ignore_ascii_case(ext))
    }

    fn open_http(&self, url: Url, offset: i64, end_offset: i64)
                 -> Result<ByteSource, DashDemuxError> {
        let mut req = self.client.get(url);
        if offset > 0 || end_offset >= 0 {
            let range = if end_offset >= 0 {
                format!("bytes={}-{}", offset, end_offset - 1)
            } else {
                format!("bytes={offset}-")
            };
            req = req.header(RANGE, range);
        }
        if let Some(referer) = &self.referer {
            req = req.header("Referer", referer.clone());
        }
        let response = req.send()
            .map_err(|e| network_error("opening media segment", e))?
            .error_for_status()
            .map_err(|e| network_error("opening media segment", e))?;
        let size = response.content_length().map_or(-1, |l| l as i64);
        Ok(ByteSource::new(Box::new(response), size))
    }

    fn open_file(&self, url: &Url, offset: i64, end_offset: i64)
                 -> Result<ByteSource, DashDemuxError> {
        let path = url.to_file_path()
            .map_err(|_| DashDemuxError::InvalidManifest(format!("invalid file URL {url}")))?;
        let mut file = File::open(&path)
            .map_err(|e| DashDemuxError::Io(e, format!("opening {}", path.display())))?;
        let total = file.metadata().map_or(-1, |m| m.len() as i64);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset as u64))
                .map_err(|e| DashDemuxError::Io(e, format!("seeking in {}", path.display())))?;
        }
        let size = if end_offset >= 0 {
            end_offset - offset
        } else if total >= 0 {
            total - offset
        } else {
            -1
        };
        let reader: Box<dyn Read + Send> = if end_offset >= 0 {
            Box::new(file.take((end_offset - offset) as u64))
        } else {
            Box::new(file)
        };
        Ok(ByteSource::new(reader, size))
    }
}

impl ResourceOpener for DefaultOpener {
    fn open_resource(&self, url: &Url, offset: i64, end_offset: i64)
                     -> Result<ByteSource, DashDemuxError> {
        let url = self.effective_url(url, true)?;
        trace!("opening {url} range {offset}..{end_offset}");
        match url.scheme() {
            "file" => self.open_file(&url, offset, end_offset),
            _ => self.open_http(url, offset, end_offset),
        }
    }

    fn fetch_document(&self, url: &Url) -> Result<(String, Url), DashDemuxError> {
        // no extension check here: the manifest URL is the user's own input, not content from a
        // manifest
        let url = self.effective_url(url, false)?;
        if url.scheme() == "file" {
            let path = url.to_file_path()
                .map_err(|_| DashDemuxError::InvalidManifest(format!("invalid file URL {url}")))?;
            let file = File::open(&path)
                .map_err(|e| DashDemuxError::Io(e, format!("opening {}", path.display())))?;
            return Ok((read_manifest_capped(file, &url)?, url));
        }
        let fetch = || {
            self.client.get(url.clone())
                .header("Accept", "application/dash+xml,video/vnd.mpeg.dash.mpd")
                .header("Accept-Language", "en-US,en")
                .send()
                .map_err(categorize_reqwest_error)
        };
        let response = retry(ExponentialBackoff::default(), fetch)
            .map_err(|e| network_error("requesting DASH manifest", unwrap_backoff(e)))?
            .error_for_status()
            .map_err(|e| network_error("requesting DASH manifest", e))?;
        let redirected = response.url().clone();
        if let Some(length) = response.content_length() {
            if length as usize > MAX_MANIFEST_SIZE {
                warn!("manifest {url} declares {length} bytes, over the size cap");
            }
        }
        let text = read_manifest_capped(response, &url)?;
        Ok((text, redirected))
    }
}
