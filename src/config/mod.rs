pub mod schema;

pub use schema::{
    Config, ConnectionConfig, GatewayConfig, HistoryConfig, LimiterConfig, MonitorConfig,
    PipelineConfig, ProviderConfig, ReliabilityConfig,
};
