//! Shared fixtures for unit tests.

use std::sync::Arc;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{Request, Response};
use tokio::sync::oneshot;

use crate::core::{
    context::{GatewayContext, ResponseSink},
    model::Rule,
    request::GatewayRequest,
};

pub fn context_with(
    uri: &str,
    headers: &[(&str, &str)],
    rule: Rule,
) -> (Arc<GatewayContext>, oneshot::Receiver<Response<AxumBody>>) {
    let mut builder = Request::builder().uri(uri).header("uniqueId", "user:1.0");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let (parts, _) = builder.body(()).unwrap().into_parts();
    let request = GatewayRequest::from_parts(&parts, Bytes::new(), "127.0.0.1:40000".parse().ok())
        .unwrap();
    let (sink, rx) = ResponseSink::channel();
    (GatewayContext::new(request, Arc::new(rule), sink), rx)
}
