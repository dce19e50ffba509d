use crate::sensors::QualityCode;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub sensor_id: String,
    pub value: f64,
    pub quality: QualityCode,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// Record shape accepted by the node forwarder's `/v1/samples` route.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedSample<'a> {
    pub sensor_id: &'a str,
    pub timestamp_ms: i64,
    pub value: f64,
    pub quality: i16,
    pub unit: &'a str,
}

impl<'a> From<&'a TelemetrySample> for ForwardedSample<'a> {
    fn from(sample: &'a TelemetrySample) -> Self {
        Self {
            sensor_id: &sample.sensor_id,
            timestamp_ms: sample.timestamp.timestamp_millis(),
            value: sample.value,
            quality: sample.quality.as_wire(),
            unit: &sample.unit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SamplesRequest<'a> {
    pub samples: Vec<ForwardedSample<'a>>,
}

impl<'a> SamplesRequest<'a> {
    pub fn new(samples: &'a [TelemetrySample]) -> Self {
        Self {
            samples: samples.iter().map(ForwardedSample::from).collect(),
        }
    }
}
