//! HTTP client for the point cloud provider and the segmentation service
//!
//! Endpoints:
//! - `GET  {base}/api/pointcloud` returns `{ points, colors }`
//! - `POST {base}/api/segment` takes positive/negative seeds, returns `{ mask }`

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cloud::{PointCloudBuffer, PointCloudResponse};
use crate::overlay::SegmentationMask;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRequest {
    pub positive_points: Vec<[f32; 3]>,
    pub negative_points: Vec<[f32; 3]>,
}

impl SegmentationRequest {
    pub fn len(&self) -> usize {
        self.positive_points.len() + self.negative_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResponse {
    #[serde(deserialize_with = "deserialize_mask")]
    pub mask: SegmentationMask,
}

/// Mask entries as sent by different model backends
#[derive(Deserialize)]
#[serde(untagged)]
enum MaskValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl MaskValue {
    fn to_bit(&self) -> u8 {
        match *self {
            MaskValue::Bool(b) => u8::from(b),
            MaskValue::Int(i) => u8::from(i != 0),
            MaskValue::Float(f) => u8::from(f != 0.0),
        }
    }
}

fn deserialize_mask<'de, D>(deserializer: D) -> Result<SegmentationMask, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<MaskValue>::deserialize(deserializer)?;
    Ok(values.iter().map(MaskValue::to_bit).collect())
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloud_seg/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch the point cloud and flatten it into a buffer
    pub async fn fetch_point_cloud(&self) -> Result<PointCloudBuffer, ApiError> {
        let url = self.url("/api/pointcloud");
        tracing::info!("Fetching point cloud from {}", url);

        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        let body: PointCloudResponse = response.json().await?;

        tracing::info!("Received {} points", body.points.len());
        Ok(PointCloudBuffer::from_response(body))
    }

    pub async fn segment(&self, request: &SegmentationRequest) -> Result<SegmentationResponse, ApiError> {
        let url = self.url("/api/segment");
        tracing::info!(
            positive = request.positive_points.len(),
            negative = request.negative_points.len(),
            "Requesting segmentation"
        );

        let response = self.client.post(&url).json(request).send().await?;
        let response = check_status(response).await?;
        let body: SegmentationResponse = response.json().await?;

        tracing::info!("Received mask of {} values", body.mask.len());
        Ok(body)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!("Server returned {}: {}", status, body);
    Err(ApiError::Status { status, body })
}

/// Read a point cloud saved in the provider's JSON shape
pub fn load_point_cloud_file<P: AsRef<Path>>(path: P) -> anyhow::Result<PointCloudBuffer> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let body: PointCloudResponse = serde_json::from_str(&content)?;
    tracing::info!("Loaded {} points from {:?}", body.points.len(), path);
    Ok(PointCloudBuffer::from_response(body))
}

pub fn save_point_cloud_file<P: AsRef<Path>>(path: P, buffer: &PointCloudBuffer) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string(&buffer.to_response())?;
    std::fs::write(path, json)?;
    tracing::info!("Saved {} points to {:?}", buffer.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = SegmentationRequest {
            positive_points: vec![[1.0, 2.0, 3.0]],
            negative_points: vec![],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "positive_points": [[1.0, 2.0, 3.0]],
                "negative_points": []
            })
        );
        assert_eq!(request.len(), 1);
    }

    #[test]
    fn test_mask_accepts_mixed_values() {
        let body = r#"{ "mask": [0, 1, 2, 0.0, 0.7, true, false] }"#;
        let response: SegmentationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.mask, vec![0, 1, 1, 0, 1, 1, 0]);
    }

    #[test]
    fn test_mask_rejects_strings() {
        let body = r#"{ "mask": ["1"] }"#;
        assert!(serde_json::from_str::<SegmentationResponse>(body).is_err());
    }

    #[test]
    fn test_point_cloud_response_parses() {
        let body = r#"{ "points": [[0, 0, 0], [1.5, 2, 3]], "colors": [[255, 0, 0], [0, 0, 255]] }"#;
        let parsed: PointCloudResponse = serde_json::from_str(body).unwrap();
        let buffer = PointCloudBuffer::from_response(parsed);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.positions()[3], 1.5);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("cloud_seg_test_{}", std::process::id()));
        let path = dir.join("cloud.json");
        let buffer = PointCloudBuffer::from_flat(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]);

        save_point_cloud_file(&path, &buffer).unwrap();
        let loaded = load_point_cloud_file(&path).unwrap();
        assert_eq!(loaded.positions(), buffer.positions());
        assert_eq!(loaded.colors(), buffer.colors());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/api/segment"), "http://localhost:8000/api/segment");
    }
}
