//! Token-based pagination over JSON list operations.

use crate::client::{ApiRequest, AwsClient};
use crate::error::{AwsError, AwsResult, ErrorKind};
use serde_json::Value;
use std::collections::HashSet;

/// One decoded page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token; `None` or empty ends the loop.
    pub next_token: Option<String>,
}

/// Dispatch pages until no continuation token remains.
///
/// `build` receives the previous page's token (`None` for the first page) and
/// returns the request. Each page is a full dispatch with its own signing and
/// retries. Items are concatenated in page order. A token seen twice stops
/// the loop with a [`ErrorKind::Client`] error.
pub async fn paginate<T, B, E>(client: &AwsClient, build: B, extract: E) -> AwsResult<Vec<T>>
where
    B: Fn(Option<&str>) -> AwsResult<ApiRequest>,
    E: Fn(&Value) -> AwsResult<Page<T>>,
{
    let mut all = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let request = build(token.as_deref())?;
        let value = client.dispatch_json(&request).await.into_result()?;
        let page = extract(&value)?;
        pages += 1;
        log::debug!(
            "AWS {} {} page {}: {} items",
            request.service,
            request.action,
            pages,
            page.items.len()
        );
        all.extend(page.items);

        match page.next_token.filter(|t| !t.is_empty()) {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    return Err(AwsError::with_kind(
                        ErrorKind::Client,
                        &request.service,
                        "RepeatedPaginationToken",
                        &format!("{} returned continuation token '{}' twice", request.action, next),
                        0,
                    )
                    .with_action(&request.action));
                }
                token = Some(next);
            }
            None => break,
        }
    }

    Ok(all)
}

/// Read a string continuation token field from a page.
pub fn next_token(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}
