// Core library for the Trellis HTTP application framework

pub mod alias;
pub mod application;
pub mod catalog;
pub mod config;
pub mod container;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod response;
pub mod routing;
pub mod sse;
pub mod static_files;
pub mod status;

#[doc(hidden)]
pub use inventory;

pub use alias::*;
pub use application::*;
pub use catalog::*;
pub use config::*;
pub use container::{
    DependencyDescriptor, DependencyDescriptorBuilder, Inject, Injectable, Service, ServiceKey,
    ServiceRegistry, validate_service_keys,
};
pub use controller::*;
pub use dispatcher::*;
pub use error::Error;
pub use http::*;
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput, Rotation};
pub use middleware::*;
pub use pipeline::*;
pub use response::{
    EmptyResponse, FileResponse, HtmlResponse, JsonResponse, RedirectResponse, file_content_type,
    Response, ResponseExt, ResponseSink, StringResponse,
};
pub use routing::*;
pub use sse::*;
pub use static_files::*;
pub use status::*;
