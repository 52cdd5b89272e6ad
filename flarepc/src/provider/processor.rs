use std::sync::Arc;

use tokio::sync::Semaphore;

use super::{InvokeContext, ProviderContainer};
use crate::{
    Error, ErrorKind, Result, SerializerType,
    protocol::{Frame, MessageCode, Request, Response, Status},
    transport::{Channel, FrameHandler},
};

/// Where decoded requests enter the provider.
pub trait ProviderProcessor: Send + Sync + 'static {
    /// Handles one REQUEST frame. Called on the connection's read task, so it must not block.
    fn handle_request(&self, channel: &Arc<Channel>, frame: Frame);

    /// Answers `invoke_id` with `error` instead of a result.
    fn handle_exception(
        &self,
        channel: &Arc<Channel>,
        invoke_id: u64,
        serializer: SerializerType,
        error: &Error,
    ) {
        let response = Response::failure(invoke_id, status_of(error), serializer, error);
        reply(channel, &response);
    }
}

/// Wire status for a failed call.
fn status_of(error: &Error) -> Status {
    match error.kind {
        ErrorKind::BadRequest | ErrorKind::DeserializeFailed | ErrorKind::SerdeJsonError => {
            Status::BadRequest
        }
        ErrorKind::ServiceNotFound => Status::ServiceNotFound,
        ErrorKind::ServerBusy => Status::ServerBusy,
        ErrorKind::ServiceUnexpectedError => Status::ServiceUnexpectedError,
        ErrorKind::SerializeFailed | ErrorKind::ServerError | ErrorKind::Shutdown => {
            Status::ServerError
        }
        _ => Status::ServiceExpectedError,
    }
}

fn reply(channel: &Arc<Channel>, response: &Response) {
    let bytes = match response.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("encode response {} failed: {e}", response.invoke_id);
            return;
        }
    };
    let channel = channel.clone();
    let invoke_id = response.invoke_id;
    tokio::spawn(async move {
        if let Err(e) = channel.write(bytes).await {
            tracing::error!("reply {invoke_id} to {} failed: {e}", channel.remote());
        }
    });
}

/// Runs every request in its own task, at most `max_in_flight` at a time.
pub struct DefaultProviderProcessor {
    container: Arc<ProviderContainer>,
    permits: Arc<Semaphore>,
}

impl DefaultProviderProcessor {
    #[must_use]
    pub fn new(container: Arc<ProviderContainer>, max_in_flight: usize) -> Self {
        Self {
            container,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    #[must_use]
    pub fn in_flight_available(&self) -> usize {
        self.permits.available_permits()
    }
}

async fn process(container: &ProviderContainer, channel: &Arc<Channel>, frame: Frame) -> Result<Response> {
    let Frame { header, body } = frame;
    let request = Request::decode(&header, body)
        .map_err(|e| Error::new(ErrorKind::BadRequest, e.msg))?;
    let Some(service) = container.lookup(&request.meta.service) else {
        return Err(Error::new(
            ErrorKind::ServiceNotFound,
            format!("service not found: {}", request.meta.service),
        ));
    };

    let ctx = InvokeContext {
        invoke_id: request.invoke_id,
        meta: request.meta.clone(),
        channel: channel.clone(),
    };
    let method = request.meta.method.clone();
    let call = service.call(ctx, request)?;
    match tokio::spawn(call).await {
        Ok(Ok(payload)) => Ok(Response::new(header.id, Status::Ok, header.serializer, payload)),
        Ok(Err(e)) => Err(e),
        Err(e) => {
            tracing::error!("{}.{method} panicked: {e}", service.meta());
            Err(Error::new(
                ErrorKind::ServiceUnexpectedError,
                format!("{}.{method} panicked", service.meta()),
            ))
        }
    }
}

impl ProviderProcessor for DefaultProviderProcessor {
    fn handle_request(&self, channel: &Arc<Channel>, frame: Frame) {
        let invoke_id = frame.header.id;
        let serializer = frame.header.serializer;
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!("too many requests in flight, reject {invoke_id}");
            self.handle_exception(
                channel,
                invoke_id,
                serializer,
                &Error::new(ErrorKind::ServerBusy, "too many requests in flight".into()),
            );
            return;
        };

        let container = self.container.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let response = match process(&container, &channel, frame).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("request {invoke_id} from {} failed: {e}", channel.remote());
                    Response::failure(invoke_id, status_of(&e), serializer, &e)
                }
            };
            reply(&channel, &response);
        });
    }
}

/// Feeds REQUEST frames of accepted connections to a [`ProviderProcessor`].
pub(crate) struct ProviderHandler(pub(crate) Arc<dyn ProviderProcessor>);

impl FrameHandler for ProviderHandler {
    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        match frame.header.code {
            MessageCode::Request => self.0.handle_request(channel, frame),
            MessageCode::Heartbeat => {}
            code => tracing::warn!("provider ignores {code:?} from {}", channel.remote()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        meta::ServiceMeta,
        protocol::{FrameDecoder, Header, RequestMeta},
        provider::ServiceWrapper,
        transport::detached_channel,
    };

    fn service() -> ServiceMeta {
        ServiceMeta::new("g", "calc", "1.0")
    }

    fn container() -> Arc<ProviderContainer> {
        let container = Arc::new(ProviderContainer::default());
        container.register(
            ServiceWrapper::new(service())
                .method("double", |_ctx, (n,): (u32,)| async move { Ok(n * 2) })
                .method("slow", |_ctx, (): ()| async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                })
                .method("boom", |_ctx, (): ()| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                })
                .method("refuse", |_ctx, (): ()| async move {
                    Err::<(), _>(Error::new(ErrorKind::Unknown("Refused".into()), "nope".into()))
                }),
        );
        container
    }

    fn request_frame(id: u64, service: ServiceMeta, method: &str, args: &impl serde::Serialize) -> Frame {
        let meta = RequestMeta {
            app_name: "test".into(),
            service,
            method: method.into(),
            trace_id: None,
        };
        let bytes = Request::new(id, SerializerType::Json, meta, args)
            .unwrap()
            .encode()
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap()
    }

    async fn next_response(receiver: &mut tokio::sync::mpsc::Receiver<Bytes>) -> Response {
        let bytes = receiver.recv().await.unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap();
        Response::decode(&frame.header, frame.body).unwrap()
    }

    #[tokio::test]
    async fn test_request_outcomes() {
        let processor = DefaultProviderProcessor::new(container(), 16);
        let (channel, mut receiver) = detached_channel(16);

        processor.handle_request(&channel, request_frame(1, service(), "double", &(21,)));
        let response = next_response(&mut receiver).await;
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.invoke_id, 1);
        assert_eq!(SerializerType::Json.deserialize::<u32>(&response.payload).unwrap(), 42);

        let cases = [
            (ServiceMeta::new("g", "other", "1.0"), "double", Status::ServiceNotFound),
            (service(), "missing", Status::ServiceUnexpectedError),
            (service(), "boom", Status::ServiceUnexpectedError),
            (service(), "refuse", Status::ServiceExpectedError),
        ];
        for (id, (service, method, status)) in (2..).zip(cases) {
            processor.handle_request(&channel, request_frame(id, service, method, &()));
            let response = next_response(&mut receiver).await;
            assert_eq!(response.status, status, "{method}");
            assert_eq!(response.invoke_id, id);
        }

        processor.handle_request(&channel, request_frame(9, service(), "refuse", &()));
        let error = next_response(&mut receiver)
            .await
            .into_outcome(None)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Unknown("Refused".into()));
    }

    #[tokio::test]
    async fn test_malformed_request_is_bad_request() {
        let processor = DefaultProviderProcessor::new(container(), 16);
        let (channel, mut receiver) = detached_channel(4);
        let header = Header::new(MessageCode::Request, SerializerType::Json, 7);
        processor.handle_request(
            &channel,
            Frame {
                header,
                body: Bytes::from_static(&[0, 0, 0, 3, b'{', b'x', b'}']),
            },
        );
        let response = next_response(&mut receiver).await;
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(response.invoke_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_busy_beyond_limit() {
        let processor = DefaultProviderProcessor::new(container(), 1);
        let (channel, mut receiver) = detached_channel(4);

        processor.handle_request(&channel, request_frame(1, service(), "slow", &()));
        processor.handle_request(&channel, request_frame(2, service(), "slow", &()));
        let busy = next_response(&mut receiver).await;
        assert_eq!(busy.invoke_id, 2);
        assert_eq!(busy.status, Status::ServerBusy);

        let done = next_response(&mut receiver).await;
        assert_eq!(done.invoke_id, 1);
        assert_eq!(done.status, Status::Ok);
        assert_eq!(processor.in_flight_available(), 1);
    }
}
