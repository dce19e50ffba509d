use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{source_name} read failed: {message}")]
    DriverFault {
        source_name: String,
        message: String,
    },

    #[error("forwarding sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("analog channel {0} is not configured")]
    ChannelNotConfigured(u8),

    #[error("channel {channel} configured more than once ({namespace})")]
    DuplicateChannel { namespace: &'static str, channel: u8 },

    #[error("sensor {sensor_id}: {reason}")]
    InvalidSensor { sensor_id: String, reason: String },

    #[error("unknown sensor type '{0}'")]
    UnknownSensorType(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl NodeError {
    pub fn driver(source_name: impl Into<String>, message: impl ToString) -> Self {
        Self::DriverFault {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_sensor(sensor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSensor {
            sensor_id: sensor_id.into(),
            reason: reason.into(),
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
