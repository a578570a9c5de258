pub mod config;
#[cfg(feature = "http")]
pub mod http;
pub mod proxy;
pub mod settings;

pub use config::{
    apply_env_overrides, load_config, load_text_file_lines, ConfigError, Configurable,
    LoadedConfig,
};
pub use proxy::{EndpointConfig, EndpointSpec, ProxySettings, RotationStrategy};
pub use settings::{
    CacheSettings, CacheStrategy, DiskCacheSettings, HttpSettings, LogFormat,
    LoggingSettings, MemoryCacheSettings, QueueSettings, RedisSettings, RobotsSettings,
    Settings, WorkerSettings,
};

#[cfg(feature = "http")]
pub use backoff;
