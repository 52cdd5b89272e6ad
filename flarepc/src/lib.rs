#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod serializer;
pub use serializer::SerializerType;

pub mod meta;
pub use meta::{Address, NotifyEvent, RegisterMeta, ServiceMeta};

pub mod config;
pub use config::Config;

mod task_supervisor;
pub use task_supervisor::{TaskGuard, TaskSupervisor};

pub mod protocol;
pub mod transport;

pub mod registry;
pub use registry::{RegistryServer, RegistryService};

pub mod consumer;
pub use consumer::{Client, ServiceProxy};

pub mod provider;
pub use provider::{ProviderServer, ServiceWrapper};
