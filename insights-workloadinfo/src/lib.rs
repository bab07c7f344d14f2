// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use anyhow::{Context, bail};
use clap::Parser;
use insights_common::anonymize::{hash_string, normalize_argument};
use insights_gather::workloads::types::{ContainerShape, WorkloadPods};
use itertools::Itertools;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{BufRead, Write};
use std::path::PathBuf;

const DEFAULT_NAMES: &str = include_str!("names.txt");

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  insights_common::global_initialize();
}

#[derive(Parser, Debug)]
#[command(about = "Restores the names hashed in a workload info archive")]
pub struct Options {
  /// A file listing names, one per line, that may be hashed in the archive.
  #[arg(long)]
  pub names: Option<PathBuf>,

  /// Read standard input and print the hashed form of each line.
  #[arg(long, default_value_t = false)]
  pub extract_names: bool,

  /// Print replacement statistics to standard error.
  #[arg(short, long, default_value_t = false)]
  pub verbose: bool,

  /// The workload info JSON document.
  pub archive: Option<PathBuf>,
}

//
// Dictionary
//

/// Maps hashes back to the names they were computed from.
#[derive(Debug, Default)]
pub struct Dictionary {
  names: HashMap<String, String>,
  /// Names whose hash was already taken by another name.
  pub collisions: Vec<String>,
}

impl Dictionary {
  #[must_use]
  pub fn with_defaults() -> Self {
    let mut dictionary = Self::default();
    dictionary.add_lines(DEFAULT_NAMES);
    dictionary
  }

  /// Adds every name of the text. Lines are trimmed, blank lines and `#` comments are skipped.
  pub fn add_lines(&mut self, text: &str) {
    for line in text.lines().map(str::trim) {
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      self.add(line);
    }
  }

  /// Adds a name under its hash and, for commands and arguments, the hash of its normalized form.
  pub fn add(&mut self, name: &str) {
    let normalized = normalize_argument(name);
    let mut hashes = vec![hash_string(name)];
    if !normalized.is_empty() && normalized != name {
      hashes.push(hash_string(normalized));
    }
    for hash in hashes {
      match self.names.entry(hash) {
        Entry::Occupied(existing) => {
          if existing.get() != name {
            self.collisions.push(name.to_string());
          }
        },
        Entry::Vacant(entry) => {
          entry.insert(name.to_string());
        },
      }
    }
  }

  #[must_use]
  pub fn get(&self, hash: &str) -> Option<&str> {
    self.names.get(hash).map(String::as_str)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.names.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

//
// ReplaceStats
//

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceStats {
  pub replaced: usize,
  pub no_name: usize,
  pub total: usize,
}

impl fmt::Display for ReplaceStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let percent = if self.total == 0 {
      0.0
    } else {
      (self.replaced + self.no_name) as f64 / self.total as f64 * 100.0
    };
    write!(
      f,
      "{percent:.1}%({}+{}/{})",
      self.replaced, self.no_name, self.total
    )
  }
}

#[derive(Debug, Default)]
pub struct Restored {
  pub namespaces: ReplaceStats,
  pub images: ReplaceStats,
  pub init_containers: ReplaceStats,
  pub containers: ReplaceStats,
  pub names_seen: BTreeSet<String>,
}

fn replace(dictionary: &Dictionary, value: &mut String, names_seen: &mut BTreeSet<String>) -> bool {
  let Some(name) = dictionary.get(value) else {
    return false;
  };
  names_seen.insert(name.to_string());
  *value = name.to_string();
  true
}

/// Restores the first command and argument of a value. Values without either only count as
/// unnamed.
fn replace_command(
  dictionary: &Dictionary,
  first_command: &mut String,
  first_arg: &mut String,
  stats: &mut ReplaceStats,
  names_seen: &mut BTreeSet<String>,
) {
  stats.total += 1;
  if first_command.is_empty() && first_arg.is_empty() {
    stats.no_name += 1;
    return;
  }
  let command = replace(dictionary, first_command, names_seen);
  let arg = replace(dictionary, first_arg, names_seen);
  if command || arg {
    stats.replaced += 1;
  }
}

fn replace_containers(
  dictionary: &Dictionary,
  containers: &mut [ContainerShape],
  stats: &mut ReplaceStats,
  names_seen: &mut BTreeSet<String>,
) {
  for container in containers {
    replace_command(
      dictionary,
      &mut container.first_command,
      &mut container.first_arg,
      stats,
      names_seen,
    );
  }
}

/// Replaces every hashed namespace, command and argument found in the dictionary.
pub fn restore(workloads: &mut WorkloadPods, dictionary: &Dictionary) -> Restored {
  let mut restored = Restored::default();

  for image in workloads.images.values_mut() {
    replace_command(
      dictionary,
      &mut image.first_command,
      &mut image.first_arg,
      &mut restored.images,
      &mut restored.names_seen,
    );
  }

  let namespaces = std::mem::take(&mut workloads.namespaces);
  for (mut namespace, mut pods) in namespaces {
    restored.namespaces.total += 1;
    for shape in &mut pods.shapes {
      replace_containers(
        dictionary,
        &mut shape.init_containers,
        &mut restored.init_containers,
        &mut restored.names_seen,
      );
      replace_containers(
        dictionary,
        &mut shape.containers,
        &mut restored.containers,
        &mut restored.names_seen,
      );
    }
    if replace(dictionary, &mut namespace, &mut restored.names_seen) {
      restored.namespaces.replaced += 1;
    }
    workloads.namespaces.insert(namespace, pods);
  }
  restored
}

/// Writes `hash(normalize(line))` for every line of the input. Content after `#` and lines that
/// normalize to nothing are skipped.
pub fn extract_names(input: impl BufRead, output: &mut impl Write) -> anyhow::Result<()> {
  for line in input.lines() {
    let line = line?;
    let line = line.split('#').next().unwrap_or_default().trim();
    let name = normalize_argument(line);
    if name.is_empty() {
      continue;
    }
    writeln!(output, "{}", hash_string(name))?;
  }
  Ok(())
}

/// Runs the tool against the provided streams.
pub fn run(
  options: &Options,
  input: impl BufRead,
  output: &mut impl Write,
  errors: &mut impl Write,
) -> anyhow::Result<()> {
  if options.extract_names {
    if options.archive.is_some() {
      bail!("when --extract-names is specified arguments are not allowed");
    }
    return extract_names(input, output);
  }

  let Some(archive) = &options.archive else {
    bail!("expected one argument listing the name of a workload info file");
  };
  let data =
    std::fs::read(archive).with_context(|| format!("unable to read {}", archive.display()))?;
  let mut workloads: WorkloadPods = serde_json::from_slice(&data)
    .with_context(|| format!("unable to parse {}", archive.display()))?;

  let mut dictionary = Dictionary::with_defaults();
  if let Some(names) = &options.names {
    let text = std::fs::read_to_string(names)
      .with_context(|| format!("unable to read {}", names.display()))?;
    dictionary.add_lines(&text);
  }
  if !dictionary.collisions.is_empty() {
    writeln!(
      errors,
      "info: hash collisions: {}",
      dictionary.collisions.iter().sorted().join(" ")
    )?;
  }
  log::debug!("loaded {} hashed names", dictionary.len());

  let restored = restore(&mut workloads, &dictionary);
  serde_json::to_writer_pretty(&mut *output, &workloads)?;
  writeln!(output)?;

  if options.verbose {
    writeln!(
      errors,
      "stats: namespaces={} images={} initContainers={} containers={}",
      restored.namespaces, restored.images, restored.init_containers, restored.containers
    )?;
    writeln!(
      errors,
      "info: names seen: {}",
      restored.names_seen.iter().join(" ")
    )?;
  }
  Ok(())
}
