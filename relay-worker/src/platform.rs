//! Learning-platform REST client.
//!
//! The platform exposes every web-service function through one endpoint,
//! `<base>/webservice/rest/server.php`, taking form-encoded parameters.
//! Failures come back as HTTP 200 with an `exception` / `errorcode` body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::queue::PlatformId;

const REST_PATH: &str = "webservice/rest/server.php";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformUser {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformCourse {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub shortname: String,
    #[serde(default)]
    pub categoryid: Option<i64>,
}

/// Lookups handlers need from the platform.
#[async_trait]
pub trait PlatformLookup: Send + Sync {
    async fn get_user_by_id(&self, id: &PlatformId) -> RelayResult<PlatformUser>;
    async fn get_course_by_id(&self, id: &PlatformId) -> RelayResult<PlatformCourse>;
}

pub struct PlatformClient {
    client: Client,
    endpoint: Url,
    token: String,
    timeout: Duration,
}

impl PlatformClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> RelayResult<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| RelayError::configuration(format!("invalid platform url: {e}")))?;
        let endpoint = base
            .join(&format!("{}/{REST_PATH}", base.path().trim_end_matches('/')))
            .map_err(|e| RelayError::configuration(format!("invalid platform url: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Call one web-service function and return its decoded JSON.
    pub async fn call(&self, function: &str, params: &[(String, String)]) -> RelayResult<Value> {
        let mut form: Vec<(String, String)> = vec![
            ("wstoken".to_string(), self.token.clone()),
            ("wsfunction".to_string(), function.to_string()),
            ("moodlewsrestformat".to_string(), "json".to_string()),
        ];
        form.extend(params.iter().cloned());

        debug!(function, endpoint = %self.endpoint, "platform_request_starting");

        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(function, timeout_seconds = self.timeout.as_secs_f64(), "platform_request_timeout");
                    RelayError::Timeout {
                        operation: function.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    error!(function, error = %e, "platform_request_error");
                    RelayError::Platform {
                        function: function.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Platform {
                function: function.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let body: Value = response.json().await.map_err(|e| RelayError::Platform {
            function: function.to_string(),
            reason: format!("invalid response body: {e}"),
        })?;
        check_response(function, body)
    }
}

/// Turn a platform error body into a [`RelayError`]; pass anything else through.
pub fn check_response(function: &str, body: Value) -> RelayResult<Value> {
    let Some(object) = body.as_object() else {
        return Ok(body);
    };
    let errorcode = object.get("errorcode").and_then(Value::as_str);
    let exception = object.get("exception").and_then(Value::as_str);
    if errorcode.is_none() && exception.is_none() {
        return Ok(body);
    }

    let message = object
        .get("message")
        .and_then(Value::as_str)
        .or(exception)
        .unwrap_or("unknown platform error")
        .to_string();

    if matches!(errorcode, Some("invalidtoken") | Some("accessexception")) {
        return Err(RelayError::InvalidToken { reason: message });
    }
    Err(RelayError::Platform {
        function: function.to_string(),
        reason: message,
    })
}

#[async_trait]
impl PlatformLookup for PlatformClient {
    async fn get_user_by_id(&self, id: &PlatformId) -> RelayResult<PlatformUser> {
        let body = self
            .call(
                "core_user_get_users_by_field",
                &[
                    ("field".to_string(), "id".to_string()),
                    ("values[0]".to_string(), id.to_string()),
                ],
            )
            .await?;
        first_user(body, id)
    }

    async fn get_course_by_id(&self, id: &PlatformId) -> RelayResult<PlatformCourse> {
        let body = self
            .call(
                "core_course_get_courses_by_field",
                &[
                    ("field".to_string(), "id".to_string()),
                    ("value".to_string(), id.to_string()),
                ],
            )
            .await?;
        first_course(body, id)
    }
}

fn first_user(body: Value, id: &PlatformId) -> RelayResult<PlatformUser> {
    let users: Vec<PlatformUser> = serde_json::from_value(body).map_err(|e| RelayError::Platform {
        function: "core_user_get_users_by_field".to_string(),
        reason: format!("unexpected response: {e}"),
    })?;
    users.into_iter().next().ok_or_else(|| RelayError::ResourceNotFound {
        resource: "user".to_string(),
        id: id.to_string(),
    })
}

fn first_course(body: Value, id: &PlatformId) -> RelayResult<PlatformCourse> {
    #[derive(Deserialize)]
    struct Courses {
        #[serde(default)]
        courses: Vec<PlatformCourse>,
    }

    let parsed: Courses = serde_json::from_value(body).map_err(|e| RelayError::Platform {
        function: "core_course_get_courses_by_field".to_string(),
        reason: format!("unexpected response: {e}"),
    })?;
    parsed
        .courses
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::ResourceNotFound {
            resource: "course".to_string(),
            id: id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_joins_rest_path() {
        let client =
            PlatformClient::new("https://lms.example.com/", "t", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "https://lms.example.com/webservice/rest/server.php"
        );

        let client =
            PlatformClient::new("https://example.com/moodle", "t", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "https://example.com/moodle/webservice/rest/server.php"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = PlatformClient::new("not a url", "t", Duration::from_secs(5))
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_error_bodies() {
        let err = check_response(
            "core_user_get_users_by_field",
            json!({"exception": "moodle_exception", "errorcode": "invalidtoken", "message": "Invalid token"}),
        )
        .unwrap_err();
        assert_eq!(err.code(), "WEBHOOK_INVALID_TOKEN");

        let err = check_response(
            "core_course_get_courses_by_field",
            json!({"exception": "invalid_parameter_exception", "errorcode": "invalidparameter"}),
        )
        .unwrap_err();
        assert_eq!(err.code(), "PLATFORM_ERROR");

        let ok = check_response("f", json!([{"id": 1}])).unwrap();
        assert!(ok.is_array());
        assert!(check_response("f", json!({"courses": []})).is_ok());
    }

    #[test]
    fn test_lookups_decode_first_row() {
        let user = first_user(
            json!([{"id": 7, "username": "ana", "firstname": "Ana", "lastname": "Lima", "email": "ana@example.com"}]),
            &PlatformId::Int(7),
        )
        .unwrap();
        assert_eq!(user.email, "ana@example.com");

        let err = first_user(json!([]), &PlatformId::Int(7)).unwrap_err();
        assert!(matches!(err, RelayError::ResourceNotFound { ref resource, ref id } if resource == "user" && id == "7"));

        let course = first_course(
            json!({"courses": [{"id": 3, "fullname": "Rust 101", "shortname": "R101", "categoryid": 1}], "warnings": []}),
            &PlatformId::Int(3),
        )
        .unwrap();
        assert_eq!(course.shortname, "R101");

        let err = first_course(json!({"courses": []}), &PlatformId::Int(3)).unwrap_err();
        assert_eq!(err.code(), "PLATFORM_RESOURCE_NOT_FOUND");
    }
}
