// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./gatherer_test.rs"]
mod gatherer_test;

use bd_shutdown::ComponentShutdownTriggerHandle;
use futures::FutureExt;
use futures::future::BoxFuture;
use insights_common::record::Record;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

//
// GatherError
//

#[derive(thiserror::Error, Debug)]
pub enum GatherError {
  #[error("gathering was cancelled")]
  Cancelled,
  #[error("conditional gather triggered, but specified alert {0:?} is not firing")]
  NotFiring(String),
  #[error(
    "not found any data for the container {container} in the Pod {pod} in the {namespace} \
     namespace"
  )]
  NoLogsFound {
    namespace: String,
    pod: String,
    container: String,
  },
}

//
// GatherOutput
//

/// The result of running a gather closure. Errors are per target failures and never discard the
/// records produced alongside them.
#[derive(Debug, Default)]
pub struct GatherOutput {
  pub records: Vec<Record>,
  pub errors: Vec<anyhow::Error>,
}

impl GatherOutput {
  #[must_use]
  pub const fn new(records: Vec<Record>, errors: Vec<anyhow::Error>) -> Self {
    Self { records, errors }
  }

  #[must_use]
  pub fn from_error(error: anyhow::Error) -> Self {
    Self {
      records: vec![],
      errors: vec![error],
    }
  }

  pub fn merge(&mut self, other: Self) {
    self.records.extend(other.records);
    self.errors.extend(other.errors);
  }
}

//
// GatheringClosure
//

type RunFn = dyn Fn(ComponentShutdownTriggerHandle) -> BoxFuture<'static, GatherOutput> + Send + Sync;

/// A named unit of gathering work that yields records and errors when run. The shutdown handle is
/// the outer cancellation context of the cycle.
#[derive(Clone)]
pub struct GatheringClosure {
  run: Arc<RunFn>,
}

impl GatheringClosure {
  pub fn new<F, Fut>(run: F) -> Self
  where
    F: Fn(ComponentShutdownTriggerHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatherOutput> + Send + 'static,
  {
    Self {
      run: Arc::new(move |shutdown| run(shutdown).boxed()),
    }
  }

  pub async fn run(&self, shutdown: ComponentShutdownTriggerHandle) -> GatherOutput {
    (self.run)(shutdown).await
  }
}

impl std::fmt::Debug for GatheringClosure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GatheringClosure").finish_non_exhaustive()
  }
}

/// Runs the gathering future until it completes or the cycle is cancelled. Cancellation discards
/// the future and reports a single cancellation error.
pub async fn until_cancelled(
  shutdown: ComponentShutdownTriggerHandle,
  gather: impl Future<Output = GatherOutput>,
) -> GatherOutput {
  let mut shutdown = shutdown.make_shutdown();
  let gather = pin!(gather);
  tokio::select! {
    output = gather => output,
    () = shutdown.cancelled() => GatherOutput::from_error(GatherError::Cancelled.into()),
  }
}
