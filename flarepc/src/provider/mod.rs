mod service;
pub use service::{InvokeContext, Method, ProviderContainer, ServiceWrapper};

mod processor;
pub use processor::{DefaultProviderProcessor, ProviderProcessor};

mod server;
pub use server::ProviderServer;
