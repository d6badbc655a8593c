//! Camera-configuration document: record shapes, loading and validation.
//!
//! The document is JSON of the form:
//!
//! ```json
//! {
//!   "crewStations": [{ "nodeId": 1, "groups": [3, 4] }],
//!   "concentrators": [{ "nodeId": 2, "cameras": [{ "id": 3, ... }] }]
//! }
//! ```
//!
//! Key presence is checked before typed deserialization so that a missing
//! section reads as an invalid configuration rather than a parse error.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};

const MAX_CAMERA_ID: u8 = 16;
const MAX_FPS: u8 = 30;
const WIDTH_RANGE: std::ops::RangeInclusive<u16> = 640..=1920;
const HEIGHT_RANGE: std::ops::RangeInclusive<u16> = 480..=1080;

/// One camera attached to a concentrator.
///
/// Only the hardware properties travel in JSON; `node_id` is filled in from
/// the enclosing concentrator entry and `group_id` is assigned by the fleet
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub id: u8,
    #[serde(skip)]
    pub node_id: u8,
    #[serde(skip)]
    pub group_id: u8,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    pub depth: u32,
    pub buffer_count: u32,
    pub compr_fmt: String,
    pub video_fmt: String,
    /// Index of the `/dev/video*` device on the concentrator.
    pub video_dev: u8,
}

impl Camera {
    /// Check the hardware properties against what the fleet supports.
    pub fn validate(&self) -> Result<()> {
        if self.id > MAX_CAMERA_ID
            || self.fps > MAX_FPS
            || !WIDTH_RANGE.contains(&self.width)
            || !HEIGHT_RANGE.contains(&self.height)
        {
            return Err(Error::with_message(
                ErrorKind::InvalidCameraConfiguration,
                format!("camera {} has out-of-range properties", self.id),
            ));
        }
        Ok(())
    }
}

/// A crew station and the multicast groups assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrewStation {
    pub node_id: u8,
    pub groups: Vec<u8>,
}

/// In-memory view of the camera-configuration document.
#[derive(Debug, Clone, Default)]
pub struct CameraConfig {
    pub cameras: Vec<Camera>,
    pub crew_stations: Vec<CrewStation>,
}

impl CameraConfig {
    /// Load and flatten the document at `path`.
    pub fn load(path: &str) -> Result<Self> {
        info!("Loading '{path}'...");
        let content = std::fs::read_to_string(path).map_err(|_| {
            Error::with_message(
                ErrorKind::JsonParseError,
                format!("Failed to load camera configuration file: {path}"),
            )
        })?;

        let doc: Value = serde_json::from_str(&content)
            .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;

        let crew_value = doc
            .get("crewStations")
            .ok_or_else(|| Error::new(ErrorKind::InvalidCameraConfiguration))?;
        let crew_stations: Vec<CrewStation> = serde_json::from_value(crew_value.clone())
            .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;

        let entries = doc
            .get("concentrators")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::new(ErrorKind::InvalidCameraConfiguration))?;

        let mut cameras = Vec::new();
        for entry in entries {
            let node_id = entry
                .get("nodeId")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    Error::with_message(ErrorKind::JsonParseError, "concentrator entry missing nodeId")
                })? as u8;

            let cam_values = entry
                .get("cameras")
                .ok_or_else(|| Error::new(ErrorKind::InvalidCameraConfiguration))?;
            let mut cams: Vec<Camera> = serde_json::from_value(cam_values.clone())
                .map_err(|e| Error::with_message(ErrorKind::JsonParseError, e.to_string()))?;
            for cam in &mut cams {
                cam.node_id = node_id;
            }
            cameras.append(&mut cams);
        }

        info!("Successfully loaded {} camera configuration(s)", cameras.len());
        Ok(Self {
            cameras,
            crew_stations,
        })
    }
}
