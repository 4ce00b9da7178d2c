//! HTTP client for the session service.
//!
//! Handles room loading, the exercise dictionary, batch uploads, the final
//! stop signal and exercise replacement.

use crate::batch::SessionBatch;
use crate::config::ServerConfig;
use crate::types::{ExerciseDetails, ExerciseSegment, RoomResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Unary operations of the session service
#[async_trait]
pub trait WorkoutApi: Send + Sync {
    /// Session auth token, also mixed into batch proofs
    fn token(&self) -> &str;

    async fn load_room(&self) -> Result<RoomResponse>;

    async fn get_exercises(&self) -> Result<HashMap<String, ExerciseDetails>>;

    async fn upload_batch(&self, batch: &SessionBatch) -> Result<()>;

    async fn stop_workout(&self) -> Result<()>;

    /// Ask the service for a different exercise in the current slot
    async fn replace_exercise(&self) -> Result<ExerciseSegment>;
}

#[derive(Deserialize)]
struct ExercisesResponse {
    exercises: HashMap<String, ExerciseDetails>,
}

#[derive(Deserialize)]
struct ReplaceResponse {
    exercise: String,
    count: u32,
}

/// `reqwest`-backed implementation of [`WorkoutApi`]
#[derive(Clone)]
pub struct HttpWorkoutApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpWorkoutApi {
    pub fn new(server: &ServerConfig, token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(server.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: server.http_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(Error::Api {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl WorkoutApi for HttpWorkoutApi {
    fn token(&self) -> &str {
        &self.token
    }

    async fn load_room(&self) -> Result<RoomResponse> {
        let resp = self
            .http
            .get(self.url("api/v1/workout/room"))
            .query(&[("w", self.token.as_str())])
            .header("Authorization", &self.token)
            .send()
            .await?;
        Ok(Self::check(resp)?.json().await?)
    }

    async fn get_exercises(&self) -> Result<HashMap<String, ExerciseDetails>> {
        let resp = self
            .http
            .get(self.url("api/v1/workout/exercises"))
            .header("Authorization", &self.token)
            .send()
            .await?;
        let body: ExercisesResponse = Self::check(resp)?.json().await?;
        Ok(body.exercises)
    }

    async fn upload_batch(&self, batch: &SessionBatch) -> Result<()> {
        let resp = self
            .http
            .post(self.url("api/v1/workout/batch"))
            .header("Authorization", &self.token)
            .header("Idempotency-Key", batch.id().to_string())
            .json(batch)
            .send()
            .await?;
        Self::check(resp)?;
        tracing::debug!(batch_id = %batch.id(), frames = batch.frame_count(), "Uploaded batch");
        Ok(())
    }

    async fn stop_workout(&self) -> Result<()> {
        let resp = self
            .http
            .post(self.url("api/v1/workout/stop"))
            .header("Authorization", &self.token)
            .send()
            .await?;
        Self::check(resp)?;
        Ok(())
    }

    async fn replace_exercise(&self) -> Result<ExerciseSegment> {
        let resp = self
            .http
            .post(self.url("api/v1/workout/replace"))
            .header("Authorization", &self.token)
            .send()
            .await?;
        let body: ReplaceResponse = Self::check(resp)?.json().await?;
        Ok(ExerciseSegment::new(body.exercise, body.count))
    }
}
