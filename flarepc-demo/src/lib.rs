use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use flarepc::{Config, Result, ServiceMeta, ServiceWrapper};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request(pub String);

pub fn echo_service() -> ServiceMeta {
    ServiceMeta::new("demo", "echo", "1.0.0")
}

/// `echo` returns the request; `greet` counts how often it was called.
pub fn echo_wrapper(weight: u32) -> ServiceWrapper {
    let greeted = Arc::new(AtomicU64::new(0));
    ServiceWrapper::new(echo_service())
        .with_weight(weight)
        .method("echo", |_ctx, (r,): (Request,)| async move { Ok(r.0) })
        .method("greet", move |_ctx, (r,): (Request,)| {
            let val = greeted.fetch_add(1, Ordering::AcqRel);
            async move { Ok(format!("hello {}({val})!", r.0)) }
        })
}

/// The JSON config at `path`, or the defaults.
pub fn load_config(path: Option<&Path>, app_name: &str) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if config.app_name == Config::default().app_name {
        config.app_name = app_name.to_string();
    }
    Ok(config)
}
