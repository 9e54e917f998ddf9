// Shared building blocks for the task runners: configuration, HTTP and
// reporting, text/HTML helpers, caching and the person graph.

pub mod cache;
pub mod calc;
pub mod config;
pub mod deadline;
pub mod flag;
pub mod graph;
pub mod html;
pub mod http;
pub mod media;
pub mod text;
