use std::sync::Arc;

use super::FutureTable;
use crate::{
    Result,
    protocol::{Frame, MessageCode, Response},
    transport::{Channel, FrameHandler},
};

/// Where decoded responses enter the consumer.
pub trait ConsumerProcessor: Send + Sync + 'static {
    fn handle_response(&self, channel: &Arc<Channel>, response: Response);
}

/// Completes the matching outstanding call.
#[derive(Debug)]
pub struct DefaultConsumerProcessor {
    futures: Arc<FutureTable>,
}

impl DefaultConsumerProcessor {
    #[must_use]
    pub fn new(futures: Arc<FutureTable>) -> Self {
        Self { futures }
    }
}

impl ConsumerProcessor for DefaultConsumerProcessor {
    fn handle_response(&self, channel: &Arc<Channel>, response: Response) {
        self.futures.received(channel.id(), response);
    }
}

/// Frame handler of consumer to provider connections.
pub(crate) struct ConsumerHandler(pub(crate) Arc<dyn ConsumerProcessor>);

impl FrameHandler for ConsumerHandler {
    fn on_frame(&self, channel: &Arc<Channel>, frame: Frame) -> Result<()> {
        match frame.header.code {
            MessageCode::Response => {
                let response = Response::decode(&frame.header, frame.body)?;
                self.0.handle_response(channel, response);
            }
            MessageCode::Heartbeat => {}
            code => tracing::warn!("unexpected {code:?} from provider {}", channel.remote()),
        }
        Ok(())
    }

    fn on_inactive(&self, channel: &Arc<Channel>) {
        tracing::info!("provider connection {} to {} closed", channel.id(), channel.remote());
    }
}
