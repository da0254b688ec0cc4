//! Queue payloads as tagged variants.
//!
//! Each queue carries one payload shape; modeling them as a sum type keeps
//! dispatch exhaustive and the serialized form self-describing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::submissions::SubmissionAction;

pub const QUEUE_SCANNER: &str = "sitemap-scanner";
pub const QUEUE_GOOGLE: &str = "google-submitter";
pub const QUEUE_INDEXNOW: &str = "indexnow-submitter";

pub const QUEUE_NAMES: [&str; 3] = [QUEUE_SCANNER, QUEUE_GOOGLE, QUEUE_INDEXNOW];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerPayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    /// None for the root delivery; the project's root sitemap URL is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sitemap_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sitemap_id: Option<Uuid>,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GooglePayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub url_ids: Vec<Uuid>,
    pub action: SubmissionAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexNowPayload {
    pub project_id: Uuid,
    pub job_id: Uuid,
    pub url_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Scanner(ScannerPayload),
    Google(GooglePayload),
    IndexNow(IndexNowPayload),
}

impl JobPayload {
    /// The queue this payload is delivered on.
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::Scanner(_) => QUEUE_SCANNER,
            JobPayload::Google(_) => QUEUE_GOOGLE,
            JobPayload::IndexNow(_) => QUEUE_INDEXNOW,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobPayload::Scanner(p) => p.job_id,
            JobPayload::Google(p) => p.job_id,
            JobPayload::IndexNow(p) => p.job_id,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            JobPayload::Scanner(p) => p.project_id,
            JobPayload::Google(p) => p.project_id,
            JobPayload::IndexNow(p) => p.project_id,
        }
    }
}
