use hyper::Request;
use tower_http::trace::MakeSpan;
use tracing::Span;

/// Request span tagged with the gateway instance, so log lines from
/// several gateways can be told apart.
#[derive(Clone)]
pub struct GatewayRequestSpan {
    env: String,
    instance_id: String,
}

impl GatewayRequestSpan {
    pub fn new(env: &str, instance_id: &str) -> Self {
        Self {
            env: env.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl<B> MakeSpan<B> for GatewayRequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            env = %self.env,
            instance_id = %self.instance_id,
            method = %request.method(),
            path = %request.uri().path(),
        )
    }
}
