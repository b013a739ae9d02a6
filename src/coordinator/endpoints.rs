//! Control-plane routes over JSON bodies, and the in-process client that
//! speaks them.

#![allow(missing_docs)]

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::coordinator::manager::TestRuntimeManager;
use crate::core::errors::{Result, SmokeError};
use crate::model::payload::{ErrorReport, PerformanceReport, TaskParameters};
use crate::worker::client::{MessageClient, Ready};

/// Prefix every route may carry.
pub const ROUTE_PREFIX: &str = "/v1/smoketest";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(STATUS_INTERNAL_ERROR, &e.to_string()),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }).to_string(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Route one request to the manager.
pub fn dispatch(manager: &TestRuntimeManager, method: Method, path: &str, body: &str) -> Response {
    let route = path.strip_prefix(ROUTE_PREFIX).unwrap_or(path);
    match (method, route) {
        (Method::Get, "/ready") => match manager.ready() {
            Ok(Ready::Ready(parameters)) => Response::json(STATUS_OK, &parameters),
            Ok(Ready::RetryLater) => Response::error(STATUS_SERVICE_UNAVAILABLE, "retry later"),
            Err(e) => Response::error(STATUS_INTERNAL_ERROR, &e.to_string()),
        },
        (Method::Get, "/runtime") => Response::json(STATUS_OK, &manager.runtime()),
        (Method::Post, "/performance") => match serde_json::from_str::<PerformanceReport>(body) {
            Ok(report) => {
                manager.on_performance(&report);
                Response::json(STATUS_OK, &report)
            }
            Err(e) => Response::error(STATUS_BAD_REQUEST, &e.to_string()),
        },
        (Method::Post, "/error") => match serde_json::from_str::<ErrorReport>(body) {
            Ok(report) => {
                manager.on_error(&report);
                Response::json(STATUS_OK, &report)
            }
            Err(e) => Response::error(STATUS_BAD_REQUEST, &e.to_string()),
        },
        _ => Response::error(STATUS_NOT_FOUND, &format!("no route for {path}")),
    }
}

/// `MessageClient` that dispatches straight into a manager in this process.
#[derive(Clone)]
pub struct LocalMessageClient {
    manager: Arc<TestRuntimeManager>,
}

impl LocalMessageClient {
    #[must_use]
    pub fn new(manager: Arc<TestRuntimeManager>) -> Self {
        Self { manager }
    }

    fn call(&self, method: Method, route: &str, body: &str) -> Response {
        dispatch(&self.manager, method, &format!("{ROUTE_PREFIX}{route}"), body)
    }

    fn post<T: Serialize>(&self, route: &str, payload: &T) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let response = self.call(Method::Post, route, &body);
        if response.is_success() {
            Ok(())
        } else {
            Err(rejected(route, &response))
        }
    }
}

fn rejected(route: &str, response: &Response) -> SmokeError {
    SmokeError::ControlPlane {
        route: route.to_string(),
        details: format!("status {}: {}", response.status, response.body),
    }
}

impl MessageClient for LocalMessageClient {
    fn get_ready(&self) -> Result<Ready> {
        let response = self.call(Method::Get, "/ready", "");
        match response.status {
            STATUS_OK => Ok(Ready::Ready(serde_json::from_str::<TaskParameters>(
                &response.body,
            )?)),
            STATUS_SERVICE_UNAVAILABLE => Ok(Ready::RetryLater),
            _ => Err(rejected("/ready", &response)),
        }
    }

    fn post_performance(&self, report: &PerformanceReport) -> Result<()> {
        self.post("/performance", report)
    }

    fn post_error(&self, report: &ErrorReport) -> Result<()> {
        self.post("/error", report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{TaskConfiguration, TestConfiguration};
    use crate::logger::activity::ActivityLoggerHandle;
    use crate::model::runtime::{TestRuntime, TestState};
    use crate::stream::memory::MemoryStreams;
    use std::thread;
    use std::time::Duration;

    fn manager() -> Arc<TestRuntimeManager> {
        let config = TestConfiguration {
            tasks: vec![TaskConfiguration {
                scope: "perf".to_string(),
                stream: "events".to_string(),
                num_writers: 1,
                ..TaskConfiguration::default()
            }],
            ..TestConfiguration::default()
        };
        Arc::new(
            TestRuntimeManager::new(
                config,
                Arc::new(MemoryStreams::new()),
                ActivityLoggerHandle::disabled(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn ready_is_unavailable_until_running() {
        let m = manager();
        let first = dispatch(&m, Method::Get, "/v1/smoketest/ready", "");
        assert_eq!(first.status, STATUS_SERVICE_UNAVAILABLE);

        let client = LocalMessageClient::new(Arc::clone(&m));
        let mut parameters = None;
        for _ in 0..200 {
            if let Ready::Ready(p) = client.get_ready().unwrap() {
                parameters = Some(p);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let TaskParameters::Stream(p) = parameters.expect("handed out");
        assert_eq!(p.task.stream, "events");
        assert_eq!(m.state(), TestState::Running);
    }

    #[test]
    fn performance_is_echoed_and_merged() {
        let m = manager();
        let report = PerformanceReport {
            worker_id: "w".to_string(),
            incarnation: "i".to_string(),
            sequence: 1,
            stream_name: "perf/events".to_string(),
            ..PerformanceReport::default()
        };
        let body = serde_json::to_string(&report).unwrap();
        let response = dispatch(&m, Method::Post, "/performance", &body);
        assert_eq!(response.status, STATUS_OK);
        let echoed: PerformanceReport = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echoed, report);

        let runtime = dispatch(&m, Method::Get, "/runtime", "");
        assert_eq!(runtime.status, STATUS_OK);
        let parsed: TestRuntime = serde_json::from_str(&runtime.body).unwrap();
        assert!(parsed.streams.contains_key("perf/events"));
        assert!(parsed.assertion_results.is_some());
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        let m = manager();
        assert_eq!(
            dispatch(&m, Method::Post, "/performance", "{nope").status,
            STATUS_BAD_REQUEST
        );
        assert_eq!(
            dispatch(&m, Method::Post, "/error", "42").status,
            STATUS_BAD_REQUEST
        );
    }

    #[test]
    fn unknown_routes_are_not_found() {
        let m = manager();
        assert_eq!(dispatch(&m, Method::Get, "/nope", "").status, STATUS_NOT_FOUND);
        assert_eq!(
            dispatch(&m, Method::Post, "/runtime", "").status,
            STATUS_NOT_FOUND
        );
    }

    #[test]
    fn client_posts_errors() {
        let m = manager();
        let client = LocalMessageClient::new(Arc::clone(&m));
        client
            .post_error(&ErrorReport::new(Some("w"), "it broke"))
            .unwrap();
        assert_eq!(m.runtime().errors[0].message, "it broke");
    }
}
