use thiserror::Error;

/// 高精度定时器预约相关的错误
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("failed to adjust timer slack: {0}")]
    Slack(#[source] std::io::Error),

    #[error("timer period is already reserved by this holder")]
    AlreadyReserved,

    #[error("timer period was never reserved")]
    NotReserved,
}

/// 配置面板的错误，引擎本身永远看不到非法值
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: {value} is out of range [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{key}: expected on/off, got {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("{key}: expected an integer, got {value:?}")]
    InvalidInteger { key: String, value: String },

    #[error("malformed parameter {0:?}, expected key=value")]
    Malformed(String),

    #[error("failed to access parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse parameter file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {stage}: failed to start: {source}")]
    Start {
        stage: &'static str,
        #[source]
        source: TimerError,
    },

    #[error("stage {stage}: failed to shut down: {source}")]
    Shutdown {
        stage: &'static str,
        #[source]
        source: TimerError,
    },

    #[error("stage {stage}: {source}")]
    Config {
        stage: &'static str,
        #[source]
        source: ConfigError,
    },
}
