use common::NamespaceId;
use futures::future::BoxFuture;
use gc::RemoteLogSource;
use reqwest::{Client, Response, Url};
use std::time::Duration;
use tracing::debug;
use txlog::ReadBatch;

use crate::handlers::ErrorBody;
use crate::ProtocolError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pulls transaction log pages from a remote log server.
#[derive(Clone, Debug)]
pub struct RemoteLogClient {
    base: Url,
    http: Client,
}

impl RemoteLogClient {
    pub fn new(base: Url) -> Result<Self, ProtocolError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn namespaces(&self) -> Result<Vec<NamespaceId>, ProtocolError> {
        let url = self.endpoint(&["namespaces"])?;
        let response = self.http.get(url).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// One page of `namespace`'s log starting at `offset`. A 404 surfaces as
    /// an error for which [`ProtocolError::is_not_found`] holds.
    pub async fn read(
        &self,
        namespace: &NamespaceId,
        offset: u64,
        count: usize,
        not_seen_at: Option<&str>,
    ) -> Result<ReadBatch, ProtocolError> {
        let mut url = self.endpoint(&["namespaces", namespace.as_str(), "log"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("offset", &offset.to_string());
            query.append_pair("count", &count.to_string());
            if let Some(site) = not_seen_at {
                query.append_pair("not_seen_at", site);
            }
        }

        let response = self.http.get(url).send().await?;
        let batch: ReadBatch = check(response).await?.json().await?;
        debug!(
            namespace = %namespace,
            offset,
            entries = batch.entries.len(),
            next_offset = batch.next_offset,
            "fetched remote log page"
        );
        Ok(batch)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProtocolError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProtocolError::Remote {
                status: 0,
                message: format!("{} cannot be used as a base URL", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl RemoteLogSource for RemoteLogClient {
    fn site(&self) -> String {
        self.base.to_string()
    }

    fn read_page<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        offset: u64,
        count: usize,
    ) -> BoxFuture<'a, anyhow::Result<Option<ReadBatch>>> {
        Box::pin(async move {
            match self.read(namespace, offset, count, None).await {
                Ok(batch) => Ok(Some(batch)),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }
}

async fn check(response: Response) -> Result<Response, ProtocolError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(ProtocolError::Remote {
        status: status.as_u16(),
        message,
    })
}
