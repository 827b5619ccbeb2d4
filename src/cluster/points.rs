//! Point operations and read results carried between peers

use crate::cluster::ShardId;
use crate::common::shard_for_point;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type PointId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointStruct {
    pub id: PointId,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A mutation of points in one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointOperation {
    Upsert { points: Vec<PointStruct> },
    Delete { ids: Vec<PointId> },
    SetPayload {
        ids: Vec<PointId>,
        payload: serde_json::Value,
    },
}

impl PointOperation {
    pub fn point_ids(&self) -> Vec<PointId> {
        match self {
            PointOperation::Upsert { points } => points.iter().map(|p| p.id).collect(),
            PointOperation::Delete { ids } | PointOperation::SetPayload { ids, .. } => ids.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PointOperation::Upsert { points } => points.is_empty(),
            PointOperation::Delete { ids } | PointOperation::SetPayload { ids, .. } => {
                ids.is_empty()
            }
        }
    }

    /// Split into one operation per shard owning the touched points
    pub fn split_by_shard(&self, shard_number: u32) -> BTreeMap<ShardId, PointOperation> {
        let mut out: BTreeMap<ShardId, PointOperation> = BTreeMap::new();
        match self {
            PointOperation::Upsert { points } => {
                for point in points {
                    let shard = shard_for_point(point.id, shard_number);
                    if let PointOperation::Upsert { points } = out
                        .entry(shard)
                        .or_insert_with(|| PointOperation::Upsert { points: Vec::new() })
                    {
                        points.push(point.clone());
                    }
                }
            }
            PointOperation::Delete { ids } => {
                for id in ids {
                    let shard = shard_for_point(*id, shard_number);
                    if let PointOperation::Delete { ids } = out
                        .entry(shard)
                        .or_insert_with(|| PointOperation::Delete { ids: Vec::new() })
                    {
                        ids.push(*id);
                    }
                }
            }
            PointOperation::SetPayload { ids, payload } => {
                for id in ids {
                    let shard = shard_for_point(*id, shard_number);
                    if let PointOperation::SetPayload { ids, .. } =
                        out.entry(shard).or_insert_with(|| PointOperation::SetPayload {
                            ids: Vec::new(),
                            payload: payload.clone(),
                        })
                    {
                        ids.push(*id);
                    }
                }
            }
        }
        out
    }
}

/// An operation as applied to a single shard replica.
///
/// `operation_id` doubles as the version stamped on every point it touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardUpdate {
    pub operation_id: u64,
    pub operation: PointOperation,
}

/// A point as stored on one replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: PointId,
    pub version: u64,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    pub version: u64,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Anything a replica returns that can be compared across replicas
pub trait Versioned {
    fn point_id(&self) -> PointId;
    fn version(&self) -> u64;
}

impl Versioned for Record {
    fn point_id(&self) -> PointId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for ScoredPoint {
    fn point_id(&self) -> PointId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
