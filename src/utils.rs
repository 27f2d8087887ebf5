use async_stream::try_stream;
use failure::Fail;
use futures::stream::Stream;
use reqwest::header::LINK;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

/// Lazily walk every page of a paginated JSON array endpoint, following the
/// `Link: <...>; rel="next"` header until there are no pages left.
///
/// The client's default headers carry our credentials, so a `next` link
/// pointing at a different origin than `first_page` is an error.
pub(crate) fn paginated<T>(
    client: Client,
    first_page: Url,
) -> impl Stream<Item = Result<T, FailedRequest>>
where
    T: DeserializeOwned + Send + 'static,
{
    try_stream! {
        let origin = first_page.origin();
        let mut page = Some(first_page);

        while let Some(endpoint) = page {
            debug!("Sending request to {}", endpoint);

            let response = client
                .get(endpoint.clone())
                .send()
                .await
                .map_err(|e| FailedRequest::new(&endpoint, e))?;
            let response = check_status(&endpoint, response)?;

            page = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);

            if let Some(next) = page.as_ref() {
                if next.origin() != origin {
                    Err::<(), _>(FailedRequest {
                        url: next.to_string(),
                        reason: format!(
                            "refusing to follow a pagination link away from {}",
                            origin.ascii_serialization()
                        ),
                    })?;
                }
            }

            let items: Vec<T> = response
                .json()
                .await
                .map_err(|e| FailedRequest::new(&endpoint, e))?;
            trace!("Received {} items from {}", items.len(), endpoint);

            for item in items {
                yield item;
            }
        }
    }
}

fn check_status(endpoint: &Url, response: Response) -> Result<Response, FailedRequest> {
    let status = response.status();
    debug!("Received response ({})", status);

    if status.is_success() {
        Ok(response)
    } else {
        warn!("Request failed with {}", status);
        Err(FailedRequest {
            url: endpoint.to_string(),
            reason: format!("Request failed with {}", status),
        })
    }
}

/// Find the `rel="next"` target in a `Link` header.
pub fn next_link(header: &str) -> Option<Url> {
    header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();

        let is_next = parts.any(|param| {
            let mut kv = param.splitn(2, '=');
            let key = kv.next().unwrap_or_default().trim();
            let value = kv.next().unwrap_or_default().trim().trim_matches('"');

            key.eq_ignore_ascii_case("rel") && value.split_whitespace().any(|rel| rel == "next")
        });

        if !is_next {
            return None;
        }

        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        Url::parse(target).ok()
    })
}

#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "Request to {} failed: {}", url, reason)]
pub struct FailedRequest {
    pub url: String,
    pub reason: String,
}

impl FailedRequest {
    fn new(url: &Url, err: reqwest::Error) -> FailedRequest {
        FailedRequest {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
