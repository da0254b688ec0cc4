// Sitemap indexing sync backend.
//
// Keeps a project's search-engine indexing state in sync with its sitemaps:
// recursive sitemap discovery, URL persistence, submission to the Google
// Indexing API and IndexNow, and live progress streaming over WebSockets.
//
// Workers consume three durable queues (sitemap-scanner, google-submitter,
// indexnow-submitter); everything user-facing beyond the live stream lives in
// an external API service.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;
pub mod sitemap;
pub mod workers;

pub use config::*;
