//! Remote record store client, OAuth2 credentials and the retry-once session.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tpdm_core::{DescriptorEntry, RemoteCandidateRef, TeacherCandidate, Vocabulary};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "tpdm-store";

const CANDIDATES_PATH: &str = "tpdm/teacherCandidates";

/// Largest `limit` an Ed-Fi ODS answers in full by default. A larger request is
/// silently capped server side, which would look like a short final page.
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("authorization rejected: {body}")]
    Unauthorized { body: String },
    #[error("http status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("acquiring credentials failed: {0}")]
    Auth(#[from] AuthError),
}

impl StoreError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StoreError::Unauthorized { .. })
    }

    /// Response body returned by the store, when there was one.
    pub fn body(&self) -> Option<&str> {
        match self {
            StoreError::Unauthorized { body } | StoreError::Rejected { body, .. } => {
                Some(body.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Unauthorized,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::UNAUTHORIZED {
        StatusClass::Unauthorized
    } else {
        StatusClass::Rejected
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn obtain_token(&self) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 client-credentials grant against a token endpoint.
#[derive(Clone)]
pub struct OAuthTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for OAuthTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl OAuthTokenProvider {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuthTokenProvider {
    async fn obtain_token(&self) -> Result<String, AuthError> {
        debug!(token_url = %self.token_url, "requesting access token");
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

/// Raw remote store operations. Each call carries the bearer token to use.
#[async_trait]
pub trait RecordStoreApi: Send + Sync {
    async fn list_descriptors(
        &self,
        token: &str,
        vocabulary: Vocabulary,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DescriptorEntry>, StoreError>;

    async fn list_candidates(
        &self,
        token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RemoteCandidateRef>, StoreError>;

    async fn upsert_candidate(
        &self,
        token: &str,
        candidate: &TeacherCandidate,
    ) -> Result<(), StoreError>;

    async fn delete_candidate(&self, token: &str, remote_id: &str) -> Result<(), StoreError>;
}

/// Ed-Fi ODS / TPDM REST implementation.
#[derive(Debug, Clone)]
pub struct EdFiHttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl EdFiHttpApi {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<T>, StoreError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await?;
        let response = check_status(response).await?;
        response.json().await.map_err(|err| StoreError::Decode {
            url,
            message: err.to_string(),
        })
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    match classify_status(status) {
        StatusClass::Success => Ok(response),
        StatusClass::Unauthorized => Err(StoreError::Unauthorized {
            body: response.text().await.unwrap_or_default(),
        }),
        StatusClass::Rejected => Err(StoreError::Rejected {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl RecordStoreApi for EdFiHttpApi {
    async fn list_descriptors(
        &self,
        token: &str,
        vocabulary: Vocabulary,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DescriptorEntry>, StoreError> {
        self.get_page(token, vocabulary.resource_path(), offset, limit)
            .await
    }

    async fn list_candidates(
        &self,
        token: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RemoteCandidateRef>, StoreError> {
        self.get_page(token, CANDIDATES_PATH, offset, limit).await
    }

    async fn upsert_candidate(
        &self,
        token: &str,
        candidate: &TeacherCandidate,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.url(CANDIDATES_PATH))
            .bearer_auth(token)
            .json(candidate)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }

    async fn delete_candidate(&self, token: &str, remote_id: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.url(&format!("{CANDIDATES_PATH}/{remote_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }
}

/// Holds the current bearer token and applies the retry-once-on-401 policy.
pub struct Session {
    provider: Box<dyn CredentialProvider>,
    token: Mutex<Option<String>>,
    refreshes: AtomicUsize,
}

impl Session {
    pub fn new(provider: Box<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            token: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Acquire the initial token. Failing here is fatal for the run.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let mut guard = self.token.lock().await;
        *guard = Some(self.provider.obtain_token().await?);
        Ok(())
    }

    /// Number of tokens obtained after a rejected call.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn current_token(&self) -> Result<String, AuthError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.provider.obtain_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        // Held across the token request so concurrent 401s refresh once at a time.
        let mut guard = self.token.lock().await;
        let token = self.provider.obtain_token().await?;
        *guard = Some(token.clone());
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }

    /// Run `call` with the current token. On [`StoreError::Unauthorized`] obtain a new
    /// token and run it exactly once more; any other outcome is returned unchanged.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let token = self.current_token().await?;
        match call(token).await {
            Err(StoreError::Unauthorized { .. }) => {
                warn!(operation, "authorization rejected; refreshing token and retrying once");
                let token = self.refresh().await?;
                call(token).await
            }
            other => other,
        }
    }
}

/// Remote store operations with the session's retry policy applied to every request.
pub struct ResilientStore {
    api: Box<dyn RecordStoreApi>,
    session: Session,
    page_size: usize,
}

impl ResilientStore {
    pub fn new(
        api: Box<dyn RecordStoreApi>,
        provider: Box<dyn CredentialProvider>,
        page_size: usize,
    ) -> Self {
        let clamped = page_size.clamp(1, MAX_PAGE_SIZE);
        if clamped != page_size {
            warn!(requested = page_size, used = clamped, "page size out of range; clamped");
        }
        Self {
            api,
            session: Session::new(provider),
            page_size: clamped,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub async fn authenticate(&self) -> Result<(), AuthError> {
        self.session.authenticate().await
    }

    pub async fn list_descriptors(
        &self,
        vocabulary: Vocabulary,
    ) -> Result<Vec<DescriptorEntry>, StoreError> {
        let api = self.api.as_ref();
        let limit = self.page_size;
        let mut entries = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .session
                .call("list_descriptors", move |token| async move {
                    api.list_descriptors(&token, vocabulary, offset, limit).await
                })
                .instrument(info_span!("list_descriptors", %vocabulary, offset))
                .await?;
            let fetched = page.len();
            entries.extend(page);
            if fetched < limit {
                break;
            }
            offset += fetched;
        }
        debug!(%vocabulary, count = entries.len(), "descriptor catalog listed");
        Ok(entries)
    }

    pub async fn list_candidates(&self) -> Result<Vec<RemoteCandidateRef>, StoreError> {
        let api = self.api.as_ref();
        let limit = self.page_size;
        let mut refs = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .session
                .call("list_candidates", move |token| async move {
                    api.list_candidates(&token, offset, limit).await
                })
                .instrument(info_span!("list_candidates", offset))
                .await?;
            let fetched = page.len();
            refs.extend(page);
            if fetched < limit {
                break;
            }
            offset += fetched;
        }
        debug!(count = refs.len(), "remote candidates listed");
        Ok(refs)
    }

    pub async fn upsert_candidate(&self, candidate: &TeacherCandidate) -> Result<(), StoreError> {
        let api = self.api.as_ref();
        self.session
            .call("upsert_candidate", move |token| async move {
                api.upsert_candidate(&token, candidate).await
            })
            .await
    }

    pub async fn delete_candidate(&self, remote_id: &str) -> Result<(), StoreError> {
        let api = self.api.as_ref();
        self.session
            .call("delete_candidate", move |token| async move {
                api.delete_candidate(&token, remote_id).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CountingProvider {
        issued: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn obtain_token(&self) -> Result<String, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }
    }

    fn session() -> (Session, Arc<AtomicUsize>) {
        let issued = Arc::new(AtomicUsize::new(0));
        let session = Session::new(Box::new(CountingProvider {
            issued: issued.clone(),
        }));
        (session, issued)
    }

    /// Serves `total` candidates but never more than `MAX_PAGE_SIZE` per page.
    struct CappedApi {
        total: usize,
        limits_seen: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl RecordStoreApi for CappedApi {
        async fn list_descriptors(
            &self,
            _token: &str,
            _vocabulary: Vocabulary,
            _offset: usize,
            _limit: usize,
        ) -> Result<Vec<DescriptorEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn list_candidates(
            &self,
            _token: &str,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<RemoteCandidateRef>, StoreError> {
            self.limits_seen.lock().expect("lock").push(limit);
            let end = self.total.min(offset + limit.min(MAX_PAGE_SIZE));
            Ok((offset..end)
                .map(|n| RemoteCandidateRef {
                    id: format!("r{n}"),
                    teacher_candidate_identifier: format!("T{n}"),
                })
                .collect())
        }

        async fn upsert_candidate(
            &self,
            _token: &str,
            _candidate: &TeacherCandidate,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_candidate(&self, _token: &str, _remote_id: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn capped_store(total: usize, page_size: usize) -> (ResilientStore, Arc<std::sync::Mutex<Vec<usize>>>) {
        let limits_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let api = CappedApi {
            total,
            limits_seen: limits_seen.clone(),
        };
        let provider = CountingProvider {
            issued: Arc::new(AtomicUsize::new(0)),
        };
        (
            ResilientStore::new(Box::new(api), Box::new(provider), page_size),
            limits_seen,
        )
    }

    #[tokio::test]
    async fn oversized_page_size_is_clamped_so_listing_is_complete() {
        let (store, limits_seen) = capped_store(1_200, 5_000);
        assert_eq!(store.page_size(), MAX_PAGE_SIZE);

        let refs = store.list_candidates().await.expect("candidates");
        assert_eq!(refs.len(), 1_200);
        assert_eq!(refs.last().map(|r| r.id.as_str()), Some("r1199"));
        assert_eq!(*limits_seen.lock().expect("lock"), vec![500, 500, 500]);
    }

    #[test]
    fn zero_page_size_becomes_one() {
        let (store, _) = capped_store(0, 0);
        assert_eq!(store.page_size(), 1);
    }

    #[test]
    fn status_classification_separates_unauthorized() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::CREATED), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), StatusClass::Unauthorized);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), StatusClass::Rejected);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Rejected);
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            StatusClass::Rejected
        );
    }

    #[tokio::test]
    async fn single_unauthorized_is_retried_with_a_fresh_token() {
        let (session, _) = session();
        session.authenticate().await.expect("auth");
        let attempts = AtomicUsize::new(0);
        let seen = std::sync::Mutex::new(Vec::new());

        let result = session
            .call("probe", |token| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                seen.lock().expect("lock").push(token);
                async move {
                    if attempt == 0 {
                        Err(StoreError::Unauthorized { body: "expired".into() })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("retried"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(session.refresh_count(), 1);
        assert_eq!(*seen.lock().expect("lock"), vec!["token-0", "token-1"]);
    }

    #[tokio::test]
    async fn second_unauthorized_propagates_without_third_attempt() {
        let (session, issued) = session();
        session.authenticate().await.expect("auth");
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = session
            .call("probe", |_token| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(StoreError::Unauthorized {
                        body: format!("denied-{attempt}"),
                    })
                }
            })
            .await;

        match result {
            Err(StoreError::Unauthorized { body }) => assert_eq!(body, "denied-1"),
            other => panic!("expected second unauthorized, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let (session, _) = session();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = session
            .call("probe", |_token| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StoreError::Rejected {
                        status: 400,
                        body: "bad payload".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Rejected { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(session.refresh_count(), 0);
    }

    #[tokio::test]
    async fn first_call_without_authenticate_obtains_a_token() {
        let (session, issued) = session();
        let token = session
            .call("probe", |token| async move { Ok::<_, StoreError>(token) })
            .await
            .expect("call");
        assert_eq!(token, "token-0");
        assert_eq!(issued.load(Ordering::SeqCst), 1);
        assert_eq!(session.refresh_count(), 0);
    }
}
