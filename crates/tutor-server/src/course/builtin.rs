//! Bundled shell curriculum, served when no course API is configured.

use super::CourseSource;
use async_trait::async_trait;
use serde_json::{json, Value};
use tutor_core::{TutorError, TutorResult};

/// Id the bundled course answers to.
pub const BUILTIN_COURSE_ID: &str = "shell-basics";

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCourse;

impl BuiltinCourse {
    pub fn course() -> Value {
        json!({
            "id": BUILTIN_COURSE_ID,
            "title": "Shell basics",
            "lessons": [
                {
                    "title": "Introduction",
                    "text": "Two terminals: yours on the left, the tutor's on the right. \
                             Press \"show me how\" to watch the tutor type."
                },
                {
                    "title": "Moving around",
                    "steps": [
                        {
                            "text": "Print the working directory.",
                            "script": ["pwd"]
                        },
                        {
                            "text": "List files, including hidden ones.",
                            "script": ["ls", "ls -la"]
                        },
                        {
                            "text": "Change directory and come back.",
                            "script": ["cd /tmp", "pwd", "cd -"]
                        }
                    ]
                },
                {
                    "title": "Files",
                    "steps": [
                        {
                            "text": "Create a file.",
                            "script": ["echo 'hello' > notes.txt"]
                        },
                        {
                            "text": "Read it back.",
                            "script": ["cat notes.txt"]
                        },
                        {
                            "text": "Copy, move and remove it.",
                            "script": ["cp notes.txt copy.txt", "mv copy.txt old.txt", "rm old.txt"]
                        }
                    ]
                },
                {
                    "title": "Pipes",
                    "text": "Chain commands together.",
                    "script": ["ls -la | wc -l", "cat notes.txt | tr a-z A-Z"]
                }
            ]
        })
    }
}

#[async_trait]
impl CourseSource for BuiltinCourse {
    async fn fetch(&self, course_id: &str) -> TutorResult<Value> {
        if course_id == BUILTIN_COURSE_ID {
            Ok(Self::course())
        } else {
            Err(TutorError::CourseNotFound(course_id.to_string()))
        }
    }

    fn default_course(&self) -> Option<Value> {
        Some(Self::course())
    }
}
