//! # HTTP Enqueuer
//!
//! Routes requests under the function mount point to subscribed targets.
//! `:name` path segments are captured as request params.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::errors::{EnqueuerError, EnqueuerResult};
use super::subscription::{Subscription, SubscriptionRegistry, SubscriptionStatus};
use super::{Description, Enqueuer, EnqueuerContext, SubscriptionInfo, TriggerKind, TriggerOptions};
use crate::queue::{Event, EventType, Header, HttpRequest, ResponseReceiver, Target};

/// Mount point of HTTP triggers
pub const MOUNT_PATH: &str = "/fn-execute";

const ALL_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD";

/// Method a route answers to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    All,
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::All => "ALL",
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
        }
    }

    pub fn matches(&self, method: &str) -> bool {
        match self {
            HttpMethod::All => true,
            other => other.as_str().eq_ignore_ascii_case(method),
        }
    }
}

fn default_preflight() -> bool {
    true
}

/// Options of an HTTP trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpOptions {
    #[serde(default)]
    pub method: HttpMethod,

    /// Route below the mount point, e.g. `/users/:id`
    pub path: String,

    /// Answer CORS preflight requests for this route
    #[serde(default = "default_preflight")]
    pub preflight: bool,
}

/// Compiled route pattern
#[derive(Debug, Clone)]
pub struct Route {
    pattern: Regex,
    params: Vec<String>,
}

impl Route {
    pub fn compile(path: &str) -> Result<Self, String> {
        if !path.starts_with('/') {
            return Err(format!("Route path '{}' must start with '/'", path));
        }

        let mut params = Vec::new();
        let mut segments = Vec::new();
        for segment in path.trim_end_matches('/').split('/') {
            match segment.strip_prefix(':') {
                Some(name) => {
                    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(format!("Invalid route parameter ':{}' in '{}'", name, path));
                    }
                    segments.push(format!("(?P<{}>[^/]+)", name));
                    params.push(name.to_string());
                }
                None => segments.push(regex::escape(segment)),
            }
        }

        let pattern = Regex::new(&format!("^{}/?$", segments.join("/")))
            .map_err(|e| format!("Invalid route '{}': {}", path, e))?;
        Ok(Self { pattern, params })
    }

    /// Captured params if `path` matches
    pub fn captures(&self, path: &str) -> Option<Vec<Header>> {
        let captures = self.pattern.captures(path)?;
        Some(
            self.params
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|value| Header::new(name.as_str(), value.as_str()))
                })
                .collect(),
        )
    }
}

/// Result of routing one request
#[derive(Debug)]
pub enum HttpDispatch {
    /// No route matched
    NotFound,
    /// CORS preflight answered without a worker
    Preflight { allow_methods: String },
    /// A worker will answer through `response`
    Enqueued {
        event_id: String,
        response: ResponseReceiver,
    },
}

enum RouteMatch {
    Preflight(HttpMethod),
    Invoke(Target, Vec<Header>),
}

/// HTTP trigger enqueuer
pub struct HttpEnqueuer {
    context: EnqueuerContext,
    registry: SubscriptionRegistry<HttpOptions, Option<Route>>,
}

impl HttpEnqueuer {
    pub fn new(context: EnqueuerContext) -> Self {
        Self {
            context,
            registry: SubscriptionRegistry::new(),
        }
    }

    /// Route a request whose `path` is relative to the mount point
    pub fn dispatch(&self, mut request: HttpRequest) -> EnqueuerResult<HttpDispatch> {
        let method = request.method.clone();
        let path = request.path.clone();

        let matched = self.registry.find_map(|sub| {
            let route = sub.handle.as_ref()?;
            let params = route.captures(&path)?;
            if method.eq_ignore_ascii_case("OPTIONS")
                && sub.options.preflight
                && sub.options.method != HttpMethod::Options
            {
                return Some(RouteMatch::Preflight(sub.options.method));
            }
            if !sub.options.method.matches(&method) {
                return None;
            }
            Some(RouteMatch::Invoke(sub.target.clone(), params))
        })?;

        let (target, params) = match matched {
            None => return Ok(HttpDispatch::NotFound),
            Some(RouteMatch::Preflight(allowed)) => {
                let allow_methods = match allowed {
                    HttpMethod::All => ALL_METHODS.to_string(),
                    other => format!("{}, OPTIONS", other.as_str()),
                };
                return Ok(HttpDispatch::Preflight { allow_methods });
            }
            Some(RouteMatch::Invoke(target, params)) => (target, params),
        };

        request.params = params;
        let event = Event::new(EventType::Http, target);
        let event_id = event.id.clone();
        let response = self.context.queues.http.enqueue(&event_id, request)?;
        debug!(event_id = %event_id, function = %event.target, "HTTP event enqueued");

        if let Err(e) = self.context.queues.events.enqueue(event) {
            self.context
                .queues
                .http
                .finalize(&event_id, 503, "Scheduler is not running");
            return Err(e.into());
        }
        Ok(HttpDispatch::Enqueued { event_id, response })
    }

    fn release(&self, subscription: Subscription<HttpOptions, Option<Route>>) {
        debug!(function = %subscription.target, path = %subscription.options.path, "HTTP route removed");
    }
}

impl Enqueuer for HttpEnqueuer {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Http
    }

    fn description(&self) -> Description {
        Description::new(
            "http",
            "HTTP",
            "http",
            "Invoke a handler for requests matching a method and path.",
        )
    }

    fn options_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "method": {
                    "type": "string",
                    "enum": ["ALL", "GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"],
                    "default": "ALL"
                },
                "path": {
                    "type": "string",
                    "description": format!("Route below {}, ':name' segments become params", MOUNT_PATH)
                },
                "preflight": {
                    "type": "boolean",
                    "default": true,
                    "description": "Answer CORS preflight requests"
                }
            }
        })
    }

    fn subscribe(&self, target: Target, options: TriggerOptions) -> EnqueuerResult<SubscriptionStatus> {
        let options = match options {
            TriggerOptions::Http(options) => options,
            other => {
                return Err(EnqueuerError::KindMismatch {
                    expected: TriggerKind::Http,
                    found: other.kind(),
                })
            }
        };

        if let Some(status) = self.registry.identical(&target, &options)? {
            return Ok(status);
        }
        if let Some(previous) = self.registry.take(&target.key())? {
            self.release(previous);
        }

        let (status, route) = match Route::compile(&options.path) {
            Ok(route) => {
                info!(function = %target, method = options.method.as_str(), path = %options.path, "HTTP route added");
                (SubscriptionStatus::open(), Some(route))
            }
            Err(message) => {
                warn!(function = %target, error = %message, "HTTP route rejected");
                (SubscriptionStatus::failed(message), None)
            }
        };

        self.registry.insert(Subscription {
            target,
            options,
            status: status.clone(),
            handle: route,
        })?;
        Ok(status)
    }

    fn unsubscribe(&self, target: &Target) -> usize {
        let removed = match self.registry.remove_matching(target) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "HTTP unsubscribe failed");
                return 0;
            }
        };
        let count = removed.len();
        for subscription in removed {
            self.release(subscription);
        }
        if count > 0 {
            self.context.scheduler.release_target(target);
        }
        count
    }

    fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry
            .snapshot()
            .unwrap_or_default()
            .into_iter()
            .map(|(target, options, status)| SubscriptionInfo {
                kind: TriggerKind::Http,
                target,
                options: serde_json::to_value(options).unwrap_or(Value::Null),
                status,
            })
            .collect()
    }
}
