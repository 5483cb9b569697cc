//! Static sample datasets and data contributions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::services::authenticator::Identity;
use crate::services::gateway::{Operation, OperationError, OperationOutput};

pub const DATASET_TYPES: [&str; 4] = ["logistics", "walkability", "gis", "all"];

/// Credits granted for one accepted contribution.
pub const CONTRIBUTION_REWARD: i64 = 5;

const DEFAULT_LIMIT: usize = 100;

/// Query string of `GET /api/datasets`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetQuery {
    #[serde(rename = "type")]
    pub dataset_type: Option<String>,
    pub format: Option<String>,
    pub limit: Option<usize>,
}

impl DatasetQuery {
    pub fn dataset_type(&self) -> &str {
        self.dataset_type.as_deref().unwrap_or("all")
    }

    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or("json")
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    /// Request metadata for the usage log.
    pub fn log_data(&self) -> Value {
        json!({
            "type": self.dataset_type(),
            "format": self.format(),
            "limit": self.limit(),
        })
    }
}

fn logistics() -> Value {
    json!({
        "warehouses": [
            { "id": 1, "name": "Bangkok Central Warehouse", "lat": 13.7563, "lng": 100.5018, "capacity": 10000 },
            { "id": 2, "name": "Chiang Mai Distribution Center", "lat": 18.7883, "lng": 98.9853, "capacity": 5000 },
            { "id": 3, "name": "Phuket Regional Hub", "lat": 7.8804, "lng": 98.3923, "capacity": 3000 }
        ],
        "routes": [
            { "from": "Bangkok", "to": "Chiang Mai", "distance": 696, "time": "8h 30m", "cost": 2500 },
            { "from": "Bangkok", "to": "Phuket", "distance": 862, "time": "10h 15m", "cost": 3200 },
            { "from": "Chiang Mai", "to": "Phuket", "distance": 1456, "time": "17h 45m", "cost": 4800 }
        ]
    })
}

fn walkability() -> Value {
    json!({
        "areas": [
            { "id": 1, "area": "Sukhumvit", "walkability_score": 85, "pedestrian_paths": 250, "accessibility": "high" },
            { "id": 2, "area": "Silom", "walkability_score": 90, "pedestrian_paths": 180, "accessibility": "high" },
            { "id": 3, "area": "Chatuchak", "walkability_score": 75, "pedestrian_paths": 120, "accessibility": "medium" }
        ],
        "infrastructure": [
            { "type": "sidewalk", "length_km": 1250, "condition": "good", "maintenance_required": false },
            { "type": "crosswalk", "count": 450, "safety_rating": "high", "accessibility_features": true },
            { "type": "bridge", "count": 85, "pedestrian_access": true, "condition": "excellent" }
        ]
    })
}

fn gis() -> Value {
    json!({
        "boundaries": [
            { "id": 1, "name": "Bangkok Metropolitan", "type": "administrative", "area_km2": 1568.7 },
            { "id": 2, "name": "Chiang Mai Province", "type": "administrative", "area_km2": 20107.0 },
            { "id": 3, "name": "Phuket Province", "type": "administrative", "area_km2": 576.0 }
        ]
    })
}

/// Sample dataset by type, `None` for an unknown type.
pub fn sample_dataset(dataset_type: &str) -> Option<Value> {
    match dataset_type {
        "logistics" => Some(logistics()),
        "walkability" => Some(walkability()),
        "gis" => Some(gis()),
        "all" => Some(json!({
            "logistics": logistics(),
            "walkability": walkability(),
            "gis": gis(),
        })),
        _ => None,
    }
}

/// Cut every record list to `limit` entries. Returns how many records remain.
fn truncate_records(value: &mut Value, limit: usize) -> usize {
    match value {
        Value::Array(records) => {
            records.truncate(limit);
            records.len()
        }
        Value::Object(map) => map
            .values_mut()
            .map(|child| truncate_records(child, limit))
            .sum(),
        _ => 0,
    }
}

/// `GET /api/datasets`.
pub struct DatasetLookup {
    query: DatasetQuery,
}

impl DatasetLookup {
    pub fn new(query: DatasetQuery) -> Self {
        Self { query }
    }
}

fn invalid_dataset_type() -> OperationError {
    OperationError::bad_request("Invalid dataset type")
        .with_context("available_types", json!(DATASET_TYPES))
}

#[async_trait]
impl Operation for DatasetLookup {
    /// Unknown types are rejected before anything is charged.
    fn validate(&self) -> Result<(), OperationError> {
        if DATASET_TYPES.contains(&self.query.dataset_type()) {
            Ok(())
        } else {
            Err(invalid_dataset_type())
        }
    }

    async fn execute(self, _caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        let dataset_type = self.query.dataset_type();

        let mut data = sample_dataset(dataset_type).ok_or_else(invalid_dataset_type)?;
        let record_count = truncate_records(&mut data, self.query.limit());

        Ok(OperationOutput::new(data)
            .with_meta("type", json!(dataset_type))
            .with_meta("format", json!(self.query.format()))
            .with_response_data(json!({ "recordCount": record_count })))
    }
}

/// Request body of `POST /api/datasets`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRequest {
    pub dataset_type: Option<String>,
    pub data: Option<Value>,
    pub contributor_info: Option<Value>,
}

/// `POST /api/datasets`: accept a contribution and reward the caller.
pub struct DataContribution {
    request: ContributionRequest,
}

impl DataContribution {
    pub fn new(request: ContributionRequest) -> Self {
        Self { request }
    }

    /// Request metadata for the usage log.
    pub fn log_data(&self) -> Value {
        json!({
            "type": self.request.dataset_type,
            "action": "contribute",
        })
    }
}

#[async_trait]
impl Operation for DataContribution {
    fn validate(&self) -> Result<(), OperationError> {
        let has_type = self
            .request
            .dataset_type
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        let has_data = self.request.data.as_ref().is_some_and(|d| !d.is_null());

        if has_type && has_data {
            Ok(())
        } else {
            Err(OperationError::bad_request("datasetType and data are required"))
        }
    }

    async fn execute(self, caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        let data_size = self
            .request
            .data
            .as_ref()
            .map_or(0, |data| data.to_string().len());

        tracing::info!(
            user = caller.map(|c| c.user.email.as_str()).unwrap_or("anonymous"),
            dataset_type = self.request.dataset_type.as_deref().unwrap_or_default(),
            data_size,
            contributor = ?self.request.contributor_info,
            "Data contribution received"
        );

        let contribution_id = format!("contrib_{}", chrono::Utc::now().timestamp_millis());

        Ok(OperationOutput::new(json!({
            "message": "Data contribution received successfully",
            "contributionId": contribution_id,
        }))
        .with_meta("creditsRewarded", json!(CONTRIBUTION_REWARD))
        .with_response_data(json!({ "status": "contributed", "dataSize": data_size }))
        .with_reward(CONTRIBUTION_REWARD))
    }
}
