pub use app_error::{AppError, AppResult};
pub use config::{
    ClientConfig, CodecKind, DelimitedConfig, LengthPrefixedConfig, NetworkConfig, TcpkitConfig,
};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
