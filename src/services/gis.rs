//! Mock GIS analysis run behind the gateway.
//!
//! No real geometry is computed: each analysis sleeps for a type-dependent multiple of the
//! configured base latency and returns randomized figures in the shape clients expect.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::services::authenticator::Identity;
use crate::services::gateway::{Operation, OperationError, OperationOutput};

pub const ANALYSIS_TYPES: [&str; 4] = ["area", "buffer", "overlay", "distance"];

/// Request body for `POST /api/gis/analyze`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub analysis_type: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub parameters: AnalysisParameters,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParameters {
    pub buffer_distance: Option<f64>,
    pub units: Option<String>,
    pub overlay_type: Option<String>,
}

/// Credits charged for an analysis type. Unknown types cost the default of 1 and are
/// rejected by validation before anything is charged.
pub fn analysis_cost(analysis_type: Option<&str>) -> i64 {
    match analysis_type {
        Some("buffer") => 2,
        Some("overlay") => 3,
        _ => 1,
    }
}

/// How many base latencies each analysis type takes.
fn latency_factor(analysis_type: &str) -> u32 {
    match analysis_type {
        "distance" => 2,
        "buffer" => 5,
        "overlay" => 10,
        _ => 1,
    }
}

pub struct GisAnalysis {
    request: AnalyzeRequest,
    base_latency: Duration,
}

impl GisAnalysis {
    pub fn new(request: AnalyzeRequest, base_latency: Duration) -> Self {
        Self {
            request,
            base_latency,
        }
    }

    fn area(data: &Value) -> Result<Value, OperationError> {
        let geometry = data
            .get("geometry")
            .filter(|geometry| !geometry.is_null())
            .ok_or_else(|| OperationError::bad_request("Invalid geometry data"))?;

        let area = rand::random::<f64>() * 10_000.0;
        Ok(json!({
            "area": area,
            "unit": "square_meters",
            "area_km2": area / 1_000_000.0,
            "geometry": geometry,
        }))
    }

    fn distance(data: &Value) -> Result<Value, OperationError> {
        let points = data
            .as_array()
            .filter(|points| points.len() >= 2)
            .ok_or_else(|| {
                OperationError::bad_request("Distance calculation requires at least 2 points")
            })?;

        let distance = rand::random::<f64>() * 1_000.0;
        Ok(json!({
            "distance": distance,
            "unit": "meters",
            "distance_km": distance / 1_000.0,
            "points": points,
        }))
    }

    fn buffer(data: &Value, parameters: &AnalysisParameters) -> Value {
        json!({
            "buffer": {
                "type": "Feature",
                "geometry": { "type": "Polygon", "coordinates": [] },
            },
            "distance": parameters.buffer_distance.unwrap_or(100.0),
            "units": parameters.units.as_deref().unwrap_or("meters"),
            "originalGeometry": data.get("geometry").cloned().unwrap_or(Value::Null),
        })
    }

    fn overlay(data: &Value, parameters: &AnalysisParameters) -> Value {
        json!({
            "overlay": {
                "type": "Feature",
                "geometry": { "type": "Polygon", "coordinates": [] },
            },
            "overlayType": parameters.overlay_type.as_deref().unwrap_or("intersection"),
            "inputCount": data.as_array().map_or(1, Vec::len),
        })
    }
}

#[async_trait]
impl Operation for GisAnalysis {
    fn validate(&self) -> Result<(), OperationError> {
        let analysis_type = self
            .request
            .analysis_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OperationError::bad_request("analysisType is required"))?;

        if self.request.data.as_ref().is_none_or(Value::is_null) {
            return Err(OperationError::bad_request("data is required"));
        }

        if !ANALYSIS_TYPES.contains(&analysis_type) {
            return Err(OperationError::bad_request(format!(
                "Invalid analysisType. Must be one of: {}",
                ANALYSIS_TYPES.join(", ")
            )));
        }

        Ok(())
    }

    async fn execute(self, _caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        let analysis_type = self.request.analysis_type.unwrap_or_default();
        let data = self.request.data.unwrap_or(Value::Null);
        let parameters = self.request.parameters;

        tokio::time::sleep(self.base_latency * latency_factor(&analysis_type)).await;

        let result = match analysis_type.as_str() {
            "area" => Self::area(&data)?,
            "distance" => Self::distance(&data)?,
            "buffer" => Self::buffer(&data, &parameters),
            "overlay" => Self::overlay(&data, &parameters),
            other => {
                return Err(OperationError::bad_request(format!(
                    "Unsupported analysis type: {other}"
                )));
            }
        };

        Ok(OperationOutput::new(result.clone())
            .with_meta("analysisType", json!(analysis_type))
            .with_response_data(result))
    }
}
