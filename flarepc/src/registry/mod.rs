mod message;
pub use message::{RegistryData, RegistryMessage};

mod non_ack;
pub use non_ack::{NonAckRecord, NonAckTable};

mod context;
pub use context::{ConfigWithVersion, RegisterInfoContext, ServiceMembers};

mod service;
pub use service::{NotifyListener, OfflineListener, RegisterState, RegistryService};

mod connector;
pub use connector::RegistryConnector;

mod server;
pub use server::RegistryServer;
