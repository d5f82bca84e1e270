//! Source system access
//!
//! [`SourceClient`] is the seam between the extractor and the operational
//! system. Implementations fetch exactly one page and classify failures; paging,
//! retries and timeouts are the extractor's job.

mod http;

pub use http::HttpSourceClient;

use crate::error::SourceError;
use crate::stage::Stage;
use crate::types::{ExtractionWindow, OperatorId};
use async_trait::async_trait;
use serde_json::Value;

/// Parameters of one page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub stage: Stage,
    pub endpoint: &'static str,
    pub window: ExtractionWindow,
    /// 1-based page number
    pub page: u32,
    pub page_size: u32,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch one page of raw records for the operator.
    async fn fetch_page(
        &self,
        operator: &OperatorId,
        request: &PageRequest,
    ) -> Result<Vec<Value>, SourceError>;
}
