// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::Serialize;

//
// RecordItem
//

/// The payload of a record. The archive writer JSON encodes structured items and writes raw items
/// as is.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordItem {
  Json(serde_json::Value),
  Raw(Vec<u8>),
}

impl RecordItem {
  pub fn json(item: &impl Serialize) -> anyhow::Result<Self> {
    Ok(Self::Json(serde_json::to_value(item)?))
  }

  /// Returns the bytes the archive writer would emit for this item.
  pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
    match self {
      Self::Json(value) => Ok(serde_json::to_vec(value)?),
      Self::Raw(bytes) => Ok(bytes.clone()),
    }
  }
}

//
// Record
//

/// A single named entry destined for the outgoing archive. Names are hierarchical paths such as
/// `config/workload_info`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub name: String,
  pub item: RecordItem,
}

impl Record {
  pub fn json(name: impl Into<String>, item: &impl Serialize) -> anyhow::Result<Self> {
    Ok(Self {
      name: name.into(),
      item: RecordItem::json(item)?,
    })
  }

  #[must_use]
  pub fn raw(name: impl Into<String>, bytes: Vec<u8>) -> Self {
    Self {
      name: name.into(),
      item: RecordItem::Raw(bytes),
    }
  }
}
