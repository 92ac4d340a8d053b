// Response types and the transport they are written to

use crate::error::Error;
use crate::http::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Where a response is written: status and headers once, then body chunks.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    fn head_written(&self) -> bool;

    /// Send the status line and headers. Fails if they were already sent or
    /// the client is gone.
    fn write_head(&mut self, status: u16, headers: &Headers) -> Result<(), Error>;

    /// Send one body chunk; requires the head to be written.
    async fn write(&mut self, chunk: Bytes) -> Result<(), Error>;

    /// End the body. Idempotent.
    fn finish(&mut self);

    fn is_finished(&self) -> bool;

    /// Completes once the client has disconnected or the body is finished.
    async fn closed(&self);
}

/// A response produced by a controller or middleware.
#[async_trait]
pub trait Response: Send {
    fn status_code(&self) -> u16;

    fn headers(&self) -> &Headers;

    /// Write status, headers and body to `sink`, then finish it.
    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error>;
}

/// Boxing shorthand for controller return values.
pub trait ResponseExt: Response + Sized + 'static {
    fn boxed(self) -> Box<dyn Response> {
        Box::new(self)
    }
}

impl<R: Response + 'static> ResponseExt for R {}

/// Write a fully buffered body.
async fn send_buffered(
    sink: &mut dyn ResponseSink,
    status: u16,
    mut headers: Headers,
    body: Bytes,
) -> Result<(), Error> {
    if !matches!(status, 100..=199 | 204 | 304) {
        headers
            .entry("Content-Length".to_string())
            .or_insert_with(|| body.len().to_string());
    }
    sink.write_head(status, &headers)?;
    if !body.is_empty() {
        sink.write(body).await?;
    }
    sink.finish();
    Ok(())
}

/// Defaults first, caller-supplied headers win.
fn merge_headers(defaults: &[(&str, String)], custom: &Headers) -> Headers {
    let mut headers: Headers = defaults
        .iter()
        .filter(|(name, _)| !custom.keys().any(|key| key.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    headers.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
    headers
}

macro_rules! response_builders {
    ($ty:ty) => {
        impl $ty {
            pub fn with_status(mut self, status: u16) -> Self {
                self.status = status;
                self
            }

            pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
                self.headers.insert(name.into(), value.into());
                self
            }
        }
    };
}

/// A response without a body.
#[derive(Debug, Clone)]
pub struct EmptyResponse {
    status: u16,
    headers: Headers,
}

impl EmptyResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }
}

response_builders!(EmptyResponse);

#[async_trait]
impl Response for EmptyResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let EmptyResponse { status, headers } = *self;
        send_buffered(sink, status, headers, Bytes::new()).await
    }
}

/// Plain text.
#[derive(Debug, Clone)]
pub struct StringResponse {
    body: String,
    status: u16,
    headers: Headers,
}

impl StringResponse {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            headers: Headers::new(),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

response_builders!(StringResponse);

#[async_trait]
impl Response for StringResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let StringResponse {
            body,
            status,
            headers,
        } = *self;
        let headers = merge_headers(
            &[("Content-Type", "text/plain; charset=utf-8".to_string())],
            &headers,
        );
        send_buffered(sink, status, headers, Bytes::from(body)).await
    }
}

/// An HTML document.
#[derive(Debug, Clone)]
pub struct HtmlResponse {
    body: String,
    status: u16,
    headers: Headers,
}

impl HtmlResponse {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            headers: Headers::new(),
        }
    }
}

response_builders!(HtmlResponse);

#[async_trait]
impl Response for HtmlResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let HtmlResponse {
            body,
            status,
            headers,
        } = *self;
        let headers = merge_headers(
            &[("Content-Type", "text/html; charset=utf-8".to_string())],
            &headers,
        );
        send_buffered(sink, status, headers, Bytes::from(body)).await
    }
}

/// A JSON document, serialized up front.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    body: Vec<u8>,
    status: u16,
    headers: Headers,
}

impl JsonResponse {
    pub fn new<T: Serialize>(value: &T) -> Result<Self, Error> {
        let body = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::from_raw(body))
    }

    /// Wrap bytes that are already JSON.
    pub fn from_raw(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            headers: Headers::new(),
        }
    }
}

response_builders!(JsonResponse);

#[async_trait]
impl Response for JsonResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let JsonResponse {
            body,
            status,
            headers,
        } = *self;
        let headers = merge_headers(&[("Content-Type", "application/json".to_string())], &headers);
        send_buffered(sink, status, headers, Bytes::from(body)).await
    }
}

/// A redirect; `303 See Other` unless another status is set.
#[derive(Debug, Clone)]
pub struct RedirectResponse {
    location: String,
    status: u16,
    headers: Headers,
}

impl RedirectResponse {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            status: 303,
            headers: Headers::new(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

response_builders!(RedirectResponse);

#[async_trait]
impl Response for RedirectResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let RedirectResponse {
            location,
            status,
            headers,
        } = *self;
        let headers = merge_headers(&[("Location", location)], &headers);
        send_buffered(sink, status, headers, Bytes::new()).await
    }
}

/// Content-Type for a file, guessed from its extension.
///
/// Plain text and HTML are declared UTF-8; unknown extensions are
/// `application/octet-stream`.
pub fn file_content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    match mime.essence_str() {
        essence @ ("text/plain" | "text/html") => format!("{essence}; charset=utf-8"),
        _ => mime.to_string(),
    }
}

/// Streams a file from disk. A missing file becomes an empty 404.
#[derive(Debug, Clone)]
pub struct FileResponse {
    path: PathBuf,
    inline: bool,
    status: u16,
    headers: Headers,
}

impl FileResponse {
    /// Served as an attachment; see [`FileResponse::inline`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inline: false,
            status: 200,
            headers: Headers::new(),
        }
    }

    /// Let the client display the file instead of downloading it.
    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

response_builders!(FileResponse);

#[async_trait]
impl Response for FileResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(_) => return Box::new(EmptyResponse::new(404)).send(sink).await,
        };
        let length = file.metadata().await?.len();

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().replace('"', ""))
            .unwrap_or_default();
        let disposition = if self.inline { "inline" } else { "attachment" };
        let headers = merge_headers(
            &[
                ("Content-Type", file_content_type(&self.path)),
                ("Content-Length", length.to_string()),
                (
                    "Content-Disposition",
                    format!("{disposition}; filename=\"{file_name}\""),
                ),
            ],
            &self.headers,
        );

        sink.write_head(self.status, &headers)?;
        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.write(Bytes::copy_from_slice(&buffer[..read])).await?;
        }
        sink.finish();
        Ok(())
    }
}
