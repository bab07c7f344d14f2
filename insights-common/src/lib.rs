// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod anonymize;
pub mod k8s;
pub mod record;

use bd_log::SwapLogger;
use bd_panic::PanicType;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  global_initialize();
}

pub fn global_initialize() {
  // The panic handler must be installed before the logger. A log line carrying thread ids that is
  // emitted during ctor will otherwise panic.
  bd_panic::default(PanicType::ForceAbort);

  SwapLogger::initialize();

  // Installation only fails if another provider won the race, which is fine.
  let _ignored = rustls::crypto::aws_lc_rs::default_provider().install_default();

  if std::env::var("ENABLE_TOKIO_CONSOLE").is_ok() {
    console_subscriber::init();
  }
}
