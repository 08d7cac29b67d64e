//! GraphQL transport for the source platform: header assembly, outcome
//! classification, host failover, and credential rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::cookies::{AuthPair, CookieBundle};
use super::timeline;
use super::{FetchDirection, MediaTimeline, SessionStatus, SourceClient, SourceError};

/// API hosts, primary first. The alternate answers the same GraphQL dialect.
pub(crate) const HOSTS: [&str; 2] = ["https://x.com/i/api", "https://twitter.com/i/api"];

/// Built-in bearer candidates used when no override is supplied. These are
/// the platform's published web-client tokens, not account secrets.
const DEFAULT_BEARERS: [&str; 2] = [
    "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA",
    "AAAAAAAAAAAAAAAAAAAAAFXzAwAAAAAAMHCxpeSDG1gLNLghVe8d74hl6k4%3DRUMF4xAQLsbeBhTSRrCiQpJtxoGWeyHrDb5te2jpGskWDFW82F",
];

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts of the full host sweep before credential rotation gives up.
const MAX_ATTEMPTS: usize = 3;

/// Well-known public handle used for the minimal session probe.
const SESSION_PROBE_HANDLE: &str = "XDevelopers";

/// One GraphQL operation: persisted-query id, operation name, and the
/// feature-flag payloads the endpoint insists on receiving.
pub(crate) struct GraphqlOperation {
    pub query_id: &'static str,
    pub name: &'static str,
    pub features: &'static str,
    pub field_toggles: Option<&'static str>,
}

pub(crate) const USER_BY_SCREEN_NAME: GraphqlOperation = GraphqlOperation {
    query_id: "G3KGOASz96M-Qu0nwmGXNg",
    name: "UserByScreenName",
    features: r#"{"hidden_profile_subscriptions_enabled":true,"rweb_tipjar_consumption_enabled":true,"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"subscriptions_verification_info_is_identity_verified_enabled":true,"subscriptions_verification_info_verified_since_enabled":true,"highlights_tweets_tab_ui_enabled":true,"responsive_web_twitter_article_notes_tab_enabled":true,"subscriptions_feature_can_gift_premium":true,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"responsive_web_graphql_timeline_navigation_enabled":true}"#,
    field_toggles: Some(r#"{"withAuxiliaryUserLabels":false}"#),
};

pub(crate) const USER_MEDIA: GraphqlOperation = GraphqlOperation {
    query_id: "MOLbHrtk8Ovu7DUNOLcXiA",
    name: "UserMedia",
    features: r#"{"rweb_tipjar_consumption_enabled":true,"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_timeline_navigation_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"communities_web_enable_tweet_community_results_fetch":true,"c9s_tweet_anatomy_moderator_badge_enabled":true,"articles_preview_enabled":true,"responsive_web_edit_tweet_api_enabled":true,"graphql_is_translatable_rweb_tweet_is_translatable_enabled":true,"view_counts_everywhere_api_enabled":true,"longform_notetweets_consumption_enabled":true,"responsive_web_twitter_article_tweet_consumption_enabled":true,"tweet_awards_web_tipping_enabled":false,"creator_subscriptions_quote_tweet_preview_enabled":false,"freedom_of_speech_not_reach_fetch_enabled":true,"standardized_nudges_misinfo":true,"tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled":true,"rweb_video_timestamps_enabled":true,"longform_notetweets_rich_text_read_enabled":true,"longform_notetweets_inline_media_enabled":true,"responsive_web_enhance_cards_enabled":false}"#,
    field_toggles: Some(r#"{"withArticlePlainText":false}"#),
};

/// Per-host request outcome, before failover policy is applied.
#[derive(Debug)]
pub(crate) enum RequestOutcome {
    Success(Value),
    RateLimited,
    AuthFailed(String),
    Failed(String),
}

/// Classify an HTTP status plus response body.
///
/// 2xx with an empty `errors[]` is success. 429 or any `errors[].code == 88`
/// is a rate limit; 401 or `errors[].code == 32` is an auth failure;
/// everything else is a generic failure.
pub(crate) fn classify_response(status: u16, body: Value) -> RequestOutcome {
    let error_codes: Vec<i64> = body
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("code").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default();
    let has_errors = body
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|e| !e.is_empty());

    if status == 429 || error_codes.contains(&88) {
        return RequestOutcome::RateLimited;
    }
    if status == 401 || error_codes.contains(&32) {
        return RequestOutcome::AuthFailed(format!(
            "status {status}, error codes {error_codes:?}"
        ));
    }
    if (200..300).contains(&status) && !has_errors {
        return RequestOutcome::Success(body);
    }
    let detail = body
        .get("errors")
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no error body".to_string());
    RequestOutcome::Failed(format!("status {status}: {detail}"))
}

/// Production [`SourceClient`] over the platform's internal GraphQL API.
///
/// Credential rotation state (which auth pair and which bearer token are in
/// use) is per-instance and advances only on auth failures.
pub struct GraphqlSourceClient {
    http: reqwest::Client,
    cookies: CookieBundle,
    auth_pairs: Vec<AuthPair>,
    bearers: Vec<String>,
    auth_index: AtomicUsize,
    bearer_index: AtomicUsize,
    preferred_host: AtomicUsize,
}

impl GraphqlSourceClient {
    /// Build a client from a parsed cookie bundle and an optional bearer
    /// token override (tried before the built-in candidates).
    pub fn new(
        cookies: CookieBundle,
        bearer_override: Option<String>,
    ) -> Result<Self, SourceError> {
        let auth_pairs = cookies.auth_pairs();
        if auth_pairs.is_empty() {
            return Err(SourceError::cookies(
                "no usable (auth_token, ct0) pair in the cookie bundle",
            ));
        }

        let mut bearers: Vec<String> = Vec::new();
        if let Some(bearer) = bearer_override {
            bearers.push(bearer);
        }
        bearers.extend(DEFAULT_BEARERS.iter().map(|b| (*b).to_string()));

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::network(e.to_string()))?;

        Ok(Self {
            http,
            cookies,
            auth_pairs,
            bearers,
            auth_index: AtomicUsize::new(0),
            bearer_index: AtomicUsize::new(0),
            preferred_host: AtomicUsize::new(0),
        })
    }

    fn current_pair(&self) -> &AuthPair {
        let index = self.auth_index.load(Ordering::SeqCst) % self.auth_pairs.len();
        &self.auth_pairs[index]
    }

    fn current_bearer(&self) -> &str {
        let index = self.bearer_index.load(Ordering::SeqCst) % self.bearers.len();
        &self.bearers[index]
    }

    /// Host indices in preferred-first order.
    fn host_order(&self) -> [usize; 2] {
        let preferred = self.preferred_host.load(Ordering::SeqCst) % HOSTS.len();
        [preferred, 1 - preferred]
    }

    /// Advance to the next credential identity: auth pairs first, then
    /// bearer tokens. Returns false when both are exhausted.
    fn rotate_credentials(&self) -> bool {
        let auth = self.auth_index.load(Ordering::SeqCst);
        if auth + 1 < self.auth_pairs.len() {
            self.auth_index.store(auth + 1, Ordering::SeqCst);
            tracing::warn!(pair = auth + 1, "rotating to next auth pair");
            return true;
        }
        let bearer = self.bearer_index.load(Ordering::SeqCst);
        if bearer + 1 < self.bearers.len() {
            self.bearer_index.store(bearer + 1, Ordering::SeqCst);
            tracing::warn!(bearer = bearer + 1, "rotating to next bearer token");
            return true;
        }
        false
    }

    /// Issue one GET against one host and classify the outcome.
    async fn request_host(
        &self,
        host: &str,
        operation: &GraphqlOperation,
        variables: &Value,
    ) -> RequestOutcome {
        let pair = self.current_pair().clone();
        let url = format!("{host}/graphql/{}/{}", operation.query_id, operation.name);
        // The origin is the host without the API path prefix.
        let origin = host.trim_end_matches("/i/api");

        let mut query: Vec<(&str, String)> = vec![
            ("variables", variables.to_string()),
            ("features", operation.features.to_string()),
        ];
        if let Some(toggles) = operation.field_toggles {
            query.push(("fieldToggles", toggles.to_string()));
        }

        let mut request = self
            .http
            .get(&url)
            .query(&query)
            .header("authorization", format!("Bearer {}", self.current_bearer()))
            .header("x-csrf-token", pair.ct0.clone())
            .header("cookie", self.cookies.header_for(&pair))
            .header("user-agent", USER_AGENT)
            .header("origin", origin)
            .header("referer", format!("{origin}/"))
            .header("x-twitter-active-user", "yes")
            .header("x-twitter-auth-type", "OAuth2Session");
        if let Some(guest_token) = self.cookies.guest_token() {
            request = request.header("x-guest-token", guest_token.to_string());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return RequestOutcome::Failed(format!("transport: {e}")),
        };
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        classify_response(status, body)
    }

    /// Run one operation through the failover policy.
    ///
    /// Each attempt sweeps every host in preferred-first order. A sweep in
    /// which every host rate-limits raises the typed rate-limit error with
    /// no further rotation; an auth failure rotates credentials and retries
    /// (bounded); anything else fails with the aggregated error.
    pub(crate) async fn execute(
        &self,
        operation: &GraphqlOperation,
        variables: Value,
    ) -> Result<Value, SourceError> {
        let mut last_error = String::from("no host attempted");

        for attempt in 0..MAX_ATTEMPTS {
            let mut limited_hosts: Vec<String> = Vec::new();
            let mut auth_failure: Option<String> = None;

            for host_index in self.host_order() {
                let host = HOSTS[host_index];
                match self.request_host(host, operation, &variables).await {
                    RequestOutcome::Success(body) => {
                        self.preferred_host.store(host_index, Ordering::SeqCst);
                        return Ok(body);
                    }
                    RequestOutcome::RateLimited => {
                        tracing::debug!(host, operation = operation.name, "host rate limited");
                        limited_hosts.push(host.to_string());
                    }
                    RequestOutcome::AuthFailed(message) => {
                        tracing::debug!(host, operation = operation.name, %message, "auth rejected");
                        auth_failure = Some(message);
                    }
                    RequestOutcome::Failed(message) => {
                        tracing::debug!(host, operation = operation.name, %message, "request failed");
                        last_error = message;
                    }
                }
            }

            if limited_hosts.len() == HOSTS.len() {
                return Err(SourceError::RateLimited {
                    hosts: limited_hosts,
                });
            }
            if let Some(message) = auth_failure {
                if self.rotate_credentials() {
                    last_error = message;
                    continue;
                }
                return Err(SourceError::auth(format!(
                    "rotation exhausted after attempt {}: {message}",
                    attempt + 1
                )));
            }
            return Err(SourceError::api(last_error));
        }

        Err(SourceError::auth(format!(
            "rotation exhausted after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }

    /// Resolve a handle to the platform's internal user id.
    pub(crate) async fn resolve_user_id(&self, handle: &str) -> Result<String, SourceError> {
        let variables = serde_json::json!({
            "screen_name": handle,
            "withSafetyModeUserFields": true,
        });
        let body = self.execute(&USER_BY_SCREEN_NAME, variables).await?;
        timeline::parse_user_id(&body, handle)
    }
}

#[async_trait]
impl SourceClient for GraphqlSourceClient {
    async fn list_posts_with_media(
        &self,
        handle: &str,
        direction: FetchDirection,
        cursor: Option<&str>,
        page_limit: u32,
    ) -> Result<MediaTimeline, SourceError> {
        let user_id = self.resolve_user_id(handle).await?;
        timeline::fetch_media_timeline(self, &user_id, handle, direction, cursor, page_limit)
            .await
    }

    async fn check_session(&self) -> Result<SessionStatus, SourceError> {
        let variables = serde_json::json!({
            "screen_name": SESSION_PROBE_HANDLE,
            "withSafetyModeUserFields": true,
        });
        match self.execute(&USER_BY_SCREEN_NAME, variables).await {
            Ok(_) => Ok(SessionStatus {
                logged_in: true,
                host: Some(HOSTS[self.preferred_host.load(Ordering::SeqCst) % HOSTS.len()].to_string()),
                reason: None,
            }),
            Err(e @ SourceError::RateLimited { .. }) => Err(e),
            Err(e) => Ok(SessionStatus {
                logged_in: false,
                host: None,
                reason: Some(e.to_string()),
            }),
        }
    }

    async fn health_check(&self, handle: &str) -> Result<(), SourceError> {
        let session = self.check_session().await?;
        if !session.logged_in {
            return Err(SourceError::auth(
                session
                    .reason
                    .unwrap_or_else(|| "session probe failed".to_string()),
            ));
        }
        self.resolve_user_id(handle).await?;
        Ok(())
    }
}
