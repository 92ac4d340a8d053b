// Default controller serving files from the configured public directory

use crate::config::{CONFIG, ConfigProvider, ServerConfig};
use crate::container::{DependencyDescriptor, Inject, Injectable, ServiceRegistry};
use crate::controller::Controller;
use crate::error::Error;
use crate::http::{HttpRequest, ParsedUrl};
use crate::logging::{info, warn};
use crate::response::{EmptyResponse, FileResponse, Response, ResponseExt, StringResponse};
use async_trait::async_trait;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];

/// Serves `server.publicFiles`, the fallback for URLs no route claims.
///
/// Directories are served through their `index.html` or `index.htm`. Every
/// file carries a weak ETag derived from its modification time, and a
/// matching `If-None-Match` yields an empty 304. Anything else, including
/// paths escaping the public directory, is a plain-text 404.
#[derive(Default)]
pub struct StaticFileController {
    config: Inject<dyn ConfigProvider>,
    public_files: Option<PathBuf>,
}

impl StaticFileController {
    async fn locate(&self, pathname: &str) -> Option<(PathBuf, Metadata)> {
        let root = tokio::fs::canonicalize(self.public_files.as_ref()?).await.ok()?;
        let requested = tokio::fs::canonicalize(root.join(pathname.trim_start_matches('/')))
            .await
            .ok()?;
        if !requested.starts_with(&root) {
            warn!(path = pathname, "Rejected path outside the public directory");
            return None;
        }

        let metadata = tokio::fs::metadata(&requested).await.ok()?;
        if metadata.is_file() {
            return Some((requested, metadata));
        }
        if metadata.is_dir() {
            for index in INDEX_FILES {
                let candidate = requested.join(index);
                if let Ok(metadata) = tokio::fs::metadata(&candidate).await {
                    if metadata.is_file() {
                        return Some((candidate, metadata));
                    }
                }
            }
        }
        None
    }
}

fn etag(metadata: &Metadata) -> String {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("W/\"{modified}-{}\"", metadata.len())
}

fn not_found(path: &str) -> Box<dyn Response> {
    info!(path, "Route not found");
    StringResponse::new("Not Found").with_status(404).boxed()
}

fn serve(path: &Path, metadata: &Metadata, request: &HttpRequest) -> Box<dyn Response> {
    let tag = etag(metadata);
    if request.header("if-none-match") == Some(tag.as_str()) {
        return EmptyResponse::new(304).with_header("ETag", tag).boxed();
    }

    let mut response = FileResponse::new(path).inline(true).with_header("ETag", tag);
    if let Ok(modified) = metadata.modified() {
        response = response.with_header("Last-Modified", httpdate::fmt_http_date(modified));
    }
    response.boxed()
}

#[async_trait]
impl Controller for StaticFileController {
    async fn handle(&self, request: &HttpRequest) -> Result<Box<dyn Response>, Error> {
        let Ok(url) = ParsedUrl::parse(&request.path) else {
            return Ok(not_found(&request.path));
        };
        match self.locate(&url.pathname).await {
            Some((path, metadata)) => Ok(serve(&path, &metadata, request)),
            None => Ok(not_found(&url.pathname)),
        }
    }
}

impl Injectable for StaticFileController {
    fn dependencies() -> DependencyDescriptor<Self> {
        DependencyDescriptor::<Self>::builder()
            .field("config", CONFIG, |controller| &mut controller.config)
            .build()
    }

    fn on_resolved(&mut self, _registry: &ServiceRegistry) -> Result<(), Error> {
        let server: ServerConfig = self.config.section_as("server")?;
        self.public_files = server.public_files;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::response::tests::BufferSink;
    use serde_json::json;
    use std::sync::Arc;

    struct Site {
        dir: tempfile::TempDir,
        registry: Arc<ServiceRegistry>,
    }

    fn site() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(public.join("docs")).unwrap();
        std::fs::write(public.join("style.css"), "body {}").unwrap();
        std::fs::write(public.join("docs/index.htm"), "<p>docs</p>").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "hidden").unwrap();

        let registry = Arc::new(ServiceRegistry::new());
        registry.register_resolved(
            StaticConfig::new().with_section("server", json!({ "publicFiles": public })),
        );
        Site { dir, registry }
    }

    async fn get(site: &Site, request: HttpRequest) -> BufferSink {
        let controller = site.registry.create(StaticFileController::default()).unwrap();
        let mut sink = BufferSink::default();
        controller
            .handle(&request)
            .await
            .unwrap()
            .send(&mut sink)
            .await
            .unwrap();
        sink
    }

    #[tokio::test]
    async fn test_serves_file_inline_with_etag() {
        let site = site();
        let sink = get(&site, HttpRequest::new("GET", "/style.css?v=2")).await;

        assert_eq!(sink.status, Some(200));
        assert_eq!(sink.body_string(), "body {}");
        assert_eq!(sink.header("content-type"), Some("text/css"));
        assert!(sink.header("content-disposition").unwrap().starts_with("inline"));
        let tag = sink.header("etag").unwrap();
        assert!(tag.starts_with("W/\""));
        // Size is part of the tag
        assert!(tag.ends_with("-7\""));
        assert!(site.dir.path().join("public/style.css").is_file());
    }

    #[tokio::test]
    async fn test_matching_etag_is_not_modified() {
        let site = site();
        let first = get(&site, HttpRequest::new("GET", "/style.css")).await;
        let tag = first.header("etag").unwrap().to_string();

        let second = get(
            &site,
            HttpRequest::new("GET", "/style.css").with_header("If-None-Match", tag.clone()),
        )
        .await;
        assert_eq!(second.status, Some(304));
        assert_eq!(second.header("etag"), Some(tag.as_str()));
        assert!(second.body.is_empty());
    }

    #[tokio::test]
    async fn test_directory_uses_index_file() {
        let site = site();
        let sink = get(&site, HttpRequest::new("GET", "/docs/")).await;
        assert_eq!(sink.status, Some(200));
        assert_eq!(sink.body_string(), "<p>docs</p>");
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths_are_not_found() {
        let site = site();
        for target in ["/nope.css", "/../secret.txt", "/%2E%2E/secret.txt", "/"] {
            let sink = get(&site, HttpRequest::new("GET", target)).await;
            assert_eq!(sink.status, Some(404), "{target}");
            assert_eq!(sink.body_string(), "Not Found");
        }
    }

    #[tokio::test]
    async fn test_without_public_directory_everything_is_not_found() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register_resolved(StaticConfig::new());
        let controller = registry.create(StaticFileController::default()).unwrap();
        let mut sink = BufferSink::default();
        controller
            .handle(&HttpRequest::new("GET", "/index.html"))
            .await
            .unwrap()
            .send(&mut sink)
            .await
            .unwrap();
        assert_eq!(sink.status, Some(404));
    }
}
