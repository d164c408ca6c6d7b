//! Curriculum sources.

pub mod builtin;
pub mod client;

pub use builtin::BuiltinCourse;
pub use client::HttpCourseSource;

use crate::config::ServerConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use tutor_core::{TutorError, TutorResult};

/// Where a session gets its course JSON from.
#[async_trait]
pub trait CourseSource: Send + Sync {
    /// Fetch a course by id.
    ///
    /// Fails with [`TutorError::CourseNotFound`] for an unknown id and
    /// [`TutorError::CourseFetch`] for anything transient.
    async fn fetch(&self, course_id: &str) -> TutorResult<Value>;

    /// Course used by `start` when the client never asked for one.
    fn default_course(&self) -> Option<Value> {
        None
    }
}

/// Pick the course source for this server.
pub fn from_config(config: &ServerConfig) -> Arc<dyn CourseSource> {
    match &config.api_host {
        Some(api_host) => {
            info!(api_host = %api_host, "using course api");
            Arc::new(HttpCourseSource::new(api_host, config.request_timeout))
        }
        None => {
            info!("no course api configured, using built-in curriculum");
            Arc::new(BuiltinCourse)
        }
    }
}

/// Course ids end up in a URL path, so only a conservative alphabet is accepted.
pub(crate) fn validate_course_id(course_id: &str) -> TutorResult<()> {
    let valid = !course_id.is_empty()
        && course_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TutorError::CourseNotFound(course_id.to_string()))
    }
}
