// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::Parser;
use insights_workloadinfo::{Options, run};
use std::io::Write;
use std::process::ExitCode;

fn main() -> ExitCode {
  insights_common::global_initialize();
  let options = Options::parse();

  let stdin = std::io::stdin().lock();
  let mut stdout = std::io::stdout().lock();
  let mut stderr = std::io::stderr().lock();
  match run(&options, stdin, &mut stdout, &mut stderr) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      let _ignored = writeln!(stderr, "error: {e:#}");
      ExitCode::FAILURE
    },
  }
}
