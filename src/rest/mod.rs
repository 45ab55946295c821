//! Typed REST client for one worker node.
//!
//! Thin wrapper over `reqwest` with a hand-rolled exponential backoff/retry
//! policy: a small `tokio::time::sleep` loop is all this needs, rather than
//! pulling in a crate for it.

pub mod error;
pub mod payload;

pub use error::Error;

use payload::{NodeInfo, RawLoadResult, RawTrack, StatsSnapshot, UpdatePlayerPatch};

use crate::track::LoadResult;

use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use tracing::{instrument, warn};

const MAX_RETRIES: u32 = 3;
const MAX_RATE_LIMIT_WAITS: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A REST client bound to one worker node.
#[derive(Clone)]
pub struct RestClient {
    http: HttpClient,
    base: String,
    password: String,
}

impl RestClient {
    /// Creates a client for the worker at `base` (e.g. `http://host:port`),
    /// authenticating with `password`.
    pub fn new(base: impl Into<String>, password: impl Into<String>) -> RestClient {
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builds with default TLS backend");

        RestClient {
            http,
            base: base.into(),
            password: password.into(),
        }
    }

    /// `GET /v4/loadtracks?identifier=...`
    #[instrument(skip(self))]
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, Error> {
        let url = format!("{}/v4/loadtracks", self.base);
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .header("Authorization", &self.password)
                    .query(&[("identifier", identifier)])
            })
            .await?;

        let raw: RawLoadResult = response.json().await.map_err(Error::Decode)?;
        Ok(raw.normalize())
    }

    /// `PATCH /v4/sessions/{session}/players/{guild}[?noReplace=true]`
    #[instrument(skip(self, patch))]
    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: u64,
        patch: &UpdatePlayerPatch,
        no_replace: bool,
    ) -> Result<(), Error> {
        let url = format!(
            "{}/v4/sessions/{}/players/{}",
            self.base, session_id, guild_id
        );

        self.send_with_retry(|| {
            let mut req = self
                .http
                .patch(&url)
                .header("Authorization", &self.password)
                .json(patch);
            if no_replace {
                req = req.query(&[("noReplace", "true")]);
            }
            req
        })
        .await?;

        Ok(())
    }

    /// `DELETE /v4/sessions/{session}/players/{guild}`. A 404 is treated as
    /// success: the resource is already gone.
    #[instrument(skip(self))]
    pub async fn destroy_player(&self, session_id: &str, guild_id: u64) -> Result<(), Error> {
        let url = format!(
            "{}/v4/sessions/{}/players/{}",
            self.base, session_id, guild_id
        );

        match self
            .send_with_retry(|| {
                self.http
                    .delete(&url)
                    .header("Authorization", &self.password)
            })
            .await
        {
            Ok(_) | Err(Error::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `GET /v4/info`
    #[instrument(skip(self))]
    pub async fn get_info(&self) -> Result<NodeInfo, Error> {
        let url = format!("{}/v4/info", self.base);
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .header("Authorization", &self.password)
            })
            .await?;

        response.json().await.map_err(Error::Decode)
    }

    /// `GET /v4/stats`
    #[instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<StatsSnapshot, Error> {
        let url = format!("{}/v4/stats", self.base);
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .header("Authorization", &self.password)
            })
            .await?;

        response.json().await.map_err(Error::Decode)
    }

    /// `GET /v4/decodetrack?encodedTrack=...`
    #[instrument(skip(self))]
    pub async fn decode_track(&self, encoded: &str) -> Result<crate::track::Track, Error> {
        let url = format!("{}/v4/decodetrack", self.base);
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .header("Authorization", &self.password)
                    .query(&[("encodedTrack", encoded)])
            })
            .await?;

        let raw: RawTrack = response.json().await.map_err(Error::Decode)?;
        Ok(raw.into_track())
    }

    /// `POST /v4/decodetracks`
    #[instrument(skip(self, encoded))]
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<crate::track::Track>, Error> {
        let url = format!("{}/v4/decodetracks", self.base);
        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .header("Authorization", &self.password)
                    .json(encoded)
            })
            .await?;

        let raw: Vec<RawTrack> = response.json().await.map_err(Error::Decode)?;
        Ok(raw.into_iter().map(RawTrack::into_track).collect())
    }

    /// Issues a request, retrying on transport failure or 5xx with
    /// exponential backoff (1s, 2s, 4s), and honoring `Retry-After` on 429
    /// without counting those waits against the retry budget (capped
    /// separately to avoid livelock).
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        let mut attempt = 0;
        let mut rate_limit_waits = 0;

        loop {
            let result = build().send().await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    match status {
                        StatusCode::NOT_FOUND => return Err(Error::NotFound),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            return Err(Error::Unauthorized)
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            if rate_limit_waits >= MAX_RATE_LIMIT_WAITS {
                                return Err(Error::RateLimited);
                            }
                            rate_limit_waits += 1;

                            let retry_after = response
                                .headers()
                                .get(reqwest::header::RETRY_AFTER)
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.parse::<u64>().ok())
                                .unwrap_or(1);

                            warn!(seconds = retry_after, "rate limited, honoring Retry-After");
                            tokio::time::sleep(Duration::from_secs(retry_after)).await;
                            continue;
                        }
                        status if status.is_server_error() => {
                            if attempt >= MAX_RETRIES {
                                return Err(Error::ServerError(status.as_u16()));
                            }
                            attempt += 1;
                            backoff_sleep(attempt).await;
                            continue;
                        }
                        status => return Err(Error::ServerError(status.as_u16())),
                    }
                }
                Err(err) => {
                    if attempt >= MAX_RETRIES {
                        return Err(Error::Transport(err));
                    }
                    attempt += 1;
                    warn!(attempt, error = %err, "transport error, retrying");
                    backoff_sleep(attempt).await;
                }
            }
        }
    }
}

/// `1s, 2s, 4s` exponential backoff by retry attempt number (1-indexed).
async fn backoff_sleep(attempt: u32) {
    let secs = 1u64 << (attempt - 1).min(10);
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::payload::RawLoadResult;
    use crate::track::LoadResult;

    #[test]
    fn normalizes_track_load_type() {
        let raw = RawLoadResult {
            load_type: "track".to_string(),
            data: serde_json::json!({
                "encoded": "abc",
                "info": {
                    "identifier": "xyz",
                    "isSeekable": true,
                    "author": "author",
                    "length": 1000,
                    "isStream": false,
                    "title": "title",
                    "uri": "https://example.com",
                    "artworkUrl": null,
                    "isrc": null,
                    "sourceName": "youtube"
                }
            }),
        };

        match raw.normalize() {
            LoadResult::Track(t) => assert_eq!(t.title, "title"),
            other => panic!("expected Track, got {other:?}"),
        }
    }

    #[test]
    fn normalizes_error_load_type() {
        let raw = RawLoadResult {
            load_type: "error".to_string(),
            data: serde_json::json!({"message": "boom", "severity": "fault"}),
        };

        match raw.normalize() {
            LoadResult::Error { message, .. } => assert_eq!(message, "boom"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_load_type_normalizes_to_empty() {
        let raw = RawLoadResult {
            load_type: "nonsense".to_string(),
            data: serde_json::Value::Null,
        };

        assert!(matches!(raw.normalize(), LoadResult::Empty));
    }
}
