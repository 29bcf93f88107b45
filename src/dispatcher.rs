//! Per-method call handling.
//!
//! Every method declared in an endpoint's descriptor set gets a
//! [`Dispatcher`] mounted on its gRPC path. Unary calls are decoded, matched
//! against the endpoint's rules and answered; streaming calls are refused
//! with `Unimplemented`.

use crate::codec::{self, RequestCodec};
use crate::descriptor::{DescriptorResolver, DescriptorSet, MethodShape};
use crate::error::DispatchError;
use crate::matcher::Matcher;
use crate::rule::{Query, RuleOutput};
use crate::template::{TemplateContext, TemplateEngine};
use axum::extract::Request as HttpRequest;
use axum::http;
use prost::bytes::Bytes;
use prost_reflect::DynamicMessage;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tonic::body::BoxBody;
use tonic::codegen::BoxFuture;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::server::{Grpc, UnaryService};
use tonic::Status;
use tracing::{debug, info, warn};

/// Header names never forwarded to the matcher.
pub const EXCLUDED_HEADERS: [&str; 5] = [
    ":authority",
    "content-type",
    "grpc-accept-encoding",
    "user-agent",
    "accept-encoding",
];

/// HTTP/2 framing headers that gRPC does not expose as call metadata.
const TRANSPORT_HEADERS: [&str; 4] = ["te", "grpc-timeout", "grpc-encoding", "content-length"];

/// Logging switches for call handling.
#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    /// Log every matched call
    pub log_matches: bool,
    /// Log calls no rule matched
    pub log_unmatched: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}

/// Call counters shared by every dispatcher of an endpoint.
#[derive(Debug, Default)]
pub struct CallStats {
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
}

impl CallStats {
    /// Total unary calls handled.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Calls answered by a rule (data or error).
    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Calls no rule matched.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

/// Handler for one method of one service.
pub struct Dispatcher {
    service: String,
    method: String,
    streaming: bool,
    resolver: Arc<dyn DescriptorResolver>,
    matcher: Arc<dyn Matcher>,
    templates: Arc<TemplateEngine>,
    stats: Arc<CallStats>,
    settings: CallSettings,
}

impl Dispatcher {
    pub fn new(
        shape: &MethodShape,
        resolver: Arc<dyn DescriptorResolver>,
        matcher: Arc<dyn Matcher>,
        templates: Arc<TemplateEngine>,
        stats: Arc<CallStats>,
        settings: CallSettings,
    ) -> Self {
        Self {
            service: shape.service.clone(),
            method: shape.method.clone(),
            streaming: shape.is_streaming(),
            resolver,
            matcher,
            templates,
            stats,
            settings,
        }
    }

    /// Answer one HTTP/2 gRPC request.
    pub async fn serve(self: Arc<Self>, request: HttpRequest) -> http::Response<BoxBody> {
        if self.streaming {
            debug!(service = %self.service, method = %self.method, "Refusing streaming call");
            return Status::unimplemented("streaming calls are not implemented").into_http();
        }

        let mut grpc = Grpc::new(RequestCodec);
        grpc.unary(UnaryHandler(self), request).await
    }

    /// Handle a decoded-to-bytes unary call.
    pub async fn dispatch(
        &self,
        metadata: &MetadataMap,
        body: &[u8],
    ) -> Result<DynamicMessage, DispatchError> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let shape = self.resolver.resolve(&self.service, &self.method)?;
        let payload = codec::decode_bytes(&shape.input, body)?;

        let query = Query {
            service: self.service.clone(),
            method: self.method.clone(),
            payload,
            headers: metadata_headers(metadata),
        };

        let Some(rule) = self.matcher.find_best_match(&query)? else {
            self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
            if self.settings.log_unmatched {
                warn!(
                    service = %self.service,
                    method = %self.method,
                    "No matching rule found"
                );
            }
            return Err(DispatchError::NotFound {
                service: self.service.clone(),
                method: self.method.clone(),
            });
        };

        self.stats.matched.fetch_add(1, Ordering::Relaxed);
        if self.settings.log_matches {
            info!(
                service = %self.service,
                method = %self.method,
                error = matches!(rule.output, RuleOutput::Error { .. }),
                "Call matched rule"
            );
        }

        match &rule.output {
            RuleOutput::Error { message, code } => Err(DispatchError::RuleDefined {
                code: *code,
                message: message.clone(),
            }),
            RuleOutput::Data {
                payload,
                template,
                delay,
            } => {
                if let Some(delay) = delay {
                    debug!(delay_ms = delay.as_millis() as u64, "Applying delay");
                    tokio::time::sleep(*delay).await;
                }

                let payload = if *template {
                    let ctx = TemplateContext::from_query(&query);
                    Cow::Owned(
                        self.templates
                            .render_payload(payload, &ctx)
                            .map_err(|e| DispatchError::Template(e.to_string()))?,
                    )
                } else {
                    Cow::Borrowed(payload)
                };

                Ok(codec::encode(&payload, &shape.output)?)
            }
        }
    }
}

struct UnaryHandler(Arc<Dispatcher>);

impl UnaryService<Bytes> for UnaryHandler {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let dispatcher = Arc::clone(&self.0);
        Box::pin(async move {
            match dispatcher.dispatch(request.metadata(), request.get_ref()).await {
                Ok(message) => Ok(tonic::Response::new(message)),
                Err(err) => {
                    debug!(
                        service = %dispatcher.service,
                        method = %dispatcher.method,
                        error = %err,
                        "Call failed"
                    );
                    Err(err.into())
                }
            }
        })
    }
}

/// Convert request metadata into matcher headers.
///
/// Binary (`-bin`) entries and HTTP/2 framing headers are dropped before
/// [`filter_headers`] applies.
pub fn metadata_headers(metadata: &MetadataMap) -> Option<BTreeMap<String, String>> {
    let pairs: Vec<(&str, &str)> = metadata
        .iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => {
                let key = key.as_str();
                if TRANSPORT_HEADERS.contains(&key) {
                    return None;
                }
                value.to_str().ok().map(|v| (key, v))
            }
            KeyAndValueRef::Binary(..) => None,
        })
        .collect();

    filter_headers(pairs)
}

/// Drop [`EXCLUDED_HEADERS`] and join repeated keys with `;`.
///
/// Returns `None` when no header survives.
pub fn filter_headers<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Option<BTreeMap<String, String>> {
    let mut grouped: BTreeMap<String, Vec<&str>> = BTreeMap::new();

    for (key, value) in pairs {
        if EXCLUDED_HEADERS.contains(&key) {
            continue;
        }
        grouped.entry(key.to_string()).or_default().push(value);
    }

    if grouped.is_empty() {
        return None;
    }

    Some(
        grouped
            .into_iter()
            .map(|(key, values)| (key, values.join(";")))
            .collect(),
    )
}

/// Mount a dispatcher for every method in `descriptors`.
pub fn build_router(
    descriptors: Arc<DescriptorSet>,
    matcher: Arc<dyn Matcher>,
    stats: Arc<CallStats>,
    settings: CallSettings,
) -> axum::Router {
    let templates = Arc::new(TemplateEngine::new());
    let resolver: Arc<dyn DescriptorResolver> = descriptors.clone();
    let mut router = axum::Router::new();

    for shape in descriptors.methods() {
        let dispatcher = Arc::new(Dispatcher::new(
            &shape,
            Arc::clone(&resolver),
            Arc::clone(&matcher),
            Arc::clone(&templates),
            Arc::clone(&stats),
            settings,
        ));

        debug!(path = %shape.path(), streaming = shape.is_streaming(), "Installing dispatcher");

        router = router.route(
            &shape.path(),
            axum::routing::post(move |request: HttpRequest| {
                let dispatcher = Arc::clone(&dispatcher);
                async move { dispatcher.serve(request).await }
            }),
        );
    }

    router.fallback(|| async { Status::unimplemented("unknown service or method").into_http() })
}
