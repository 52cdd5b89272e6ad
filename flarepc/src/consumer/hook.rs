use crate::{
    protocol::{Request, Response},
    transport::Channel,
};

/// Observes calls on the consumer side.
pub trait ConsumerHook: Send + Sync {
    /// After the request was handed to the channel.
    fn before(&self, _request: &Request, _channel: &Channel) {}

    /// When the response (or a local timeout or failure) completes the call.
    fn after(&self, _response: &Response, _channel: &Channel) {}
}

/// Logs every call at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl ConsumerHook for TracingHook {
    fn before(&self, request: &Request, channel: &Channel) {
        tracing::debug!(
            "invoke {} {}.{} -> {}",
            request.invoke_id,
            request.meta.service,
            request.meta.method,
            channel.remote()
        );
    }

    fn after(&self, response: &Response, channel: &Channel) {
        tracing::debug!(
            "invoke {} <- {}: {:?}",
            response.invoke_id,
            channel.remote(),
            response.status
        );
    }
}
