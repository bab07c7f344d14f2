// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod conditional;
pub mod config;
pub mod gatherer;
pub mod lru_map;
pub mod workloads;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  insights_common::global_initialize();
}
