//! HTTP client for the course API.

use super::{validate_course_id, CourseSource};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use tutor_core::{TutorError, TutorResult};

/// Fetches `GET {api_host}/api/course/{id}`.
pub struct HttpCourseSource {
    api_host: String,
    http_client: reqwest::Client,
}

impl HttpCourseSource {
    pub fn new(api_host: &str, timeout: Duration) -> Self {
        Self {
            api_host: api_host.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn course_url(&self, course_id: &str) -> String {
        format!("{}/api/course/{course_id}", self.api_host)
    }
}

#[async_trait]
impl CourseSource for HttpCourseSource {
    async fn fetch(&self, course_id: &str) -> TutorResult<Value> {
        validate_course_id(course_id)?;
        let url = self.course_url(course_id);
        debug!(url = %url, "fetching course");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "course request failed");
            TutorError::CourseFetch(format!("{url}: {e}"))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!(course_id, "course does not exist");
            return Err(TutorError::CourseNotFound(course_id.to_string()));
        }
        if !status.is_success() {
            warn!(url = %url, status = %status, "course api error");
            return Err(TutorError::CourseFetch(format!("{url}: HTTP {status}")));
        }

        let course: Value = response
            .json()
            .await
            .map_err(|e| TutorError::CourseFetch(format!("{url}: invalid course json: {e}")))?;
        info!(course_id, "course fetched");
        Ok(course)
    }
}
