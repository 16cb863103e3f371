//! The opaque authenticated browsing capability.
//!
//! How the session came to be (login form, cookies, a real browser) is the
//! caller's business. The pipeline only needs something that can render
//! successive pages of the achievements listing as HTML.

use tracing::debug;

use crate::config::{CR_PAGE_URL_TEMPLATE, REQUEST_TIMEOUT};
use crate::error::ExtractionError;

/// A positioned session over one athlete's Course Records listing. One pass:
/// `advance` renders the next page, `None` means the source has no more.
pub trait RecordPage {
    fn advance(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<String>, ExtractionError>> + Send;
}

/// HTTP rendition of the session: the caller supplies the platform session
/// cookie, pages advance via the `page` query parameter.
pub struct HttpRecordPage {
    client: reqwest::Client,
    base_url: String,
    next_page: u32,
}

impl HttpRecordPage {
    pub fn new(athlete_id: &str, session_cookie: &str) -> Result<Self, ExtractionError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let cookie = reqwest::header::HeaderValue::from_str(session_cookie)
            .map_err(|e| ExtractionError::SessionLost(format!("bad session cookie: {e}")))?;
        headers.insert(reqwest::header::COOKIE, cookie);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExtractionError::SessionLost(e.to_string()))?;

        Ok(Self {
            client,
            base_url: CR_PAGE_URL_TEMPLATE.replace("{athlete_id}", athlete_id),
            next_page: 1,
        })
    }
}

impl RecordPage for HttpRecordPage {
    async fn advance(&mut self) -> Result<Option<String>, ExtractionError> {
        let page_number = self.next_page;
        let url = if page_number == 1 {
            self.base_url.clone()
        } else {
            format!("{}?page={}", self.base_url, page_number)
        };
        debug!("Fetching CR page {}", page_number);
        self.next_page += 1;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExtractionError::SessionLost(e.to_string()))?;

        if !page_status(response.status().as_u16(), page_number)? {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExtractionError::SessionLost(e.to_string()))?;
        Ok(Some(body))
    }
}

/// `Ok(true)`: read the body. `Ok(false)`: the pager ran off the end, which
/// is normal exhaustion, not a lost session. `Err`: the session is gone.
fn page_status(status: u16, page_number: u32) -> Result<bool, ExtractionError> {
    match status {
        200..=299 => Ok(true),
        401 | 403 => Err(ExtractionError::SessionLost(format!(
            "HTTP {status} — session expired or logged out"
        ))),
        404 if page_number > 1 => Ok(false),
        _ => Err(ExtractionError::SessionLost(format!(
            "HTTP {status} on page {page_number}"
        ))),
    }
}

// ── Tests ──
