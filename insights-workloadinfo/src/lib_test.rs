// insights - cluster telemetry gathering core
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use insights_gather::workloads::types::{NamespacePods, PodShape, WorkloadImage};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;

fn options(archive: Option<PathBuf>, names: Option<PathBuf>, verbose: bool) -> Options {
  Options {
    names,
    extract_names: false,
    verbose,
    archive,
  }
}

fn container(command: &str, arg: &str) -> ContainerShape {
  ContainerShape {
    image_id: "sha256:a".to_string(),
    first_command: command.to_string(),
    first_arg: arg.to_string(),
    ..Default::default()
  }
}

fn archive() -> WorkloadPods {
  WorkloadPods {
    pod_count: 3,
    image_count: 2,
    images: BTreeMap::from([
      (
        "sha256:a".to_string(),
        WorkloadImage {
          layer_ids: vec!["sha256:l1".to_string()],
          first_command: hash_string("custom-tool"),
          first_arg: String::new(),
        },
      ),
      (
        "sha256:b".to_string(),
        WorkloadImage {
          layer_ids: vec!["sha256:l2".to_string()],
          ..Default::default()
        },
      ),
    ]),
    namespaces: BTreeMap::from([
      (
        hash_string("openshift-etcd"),
        NamespacePods {
          count: 2,
          shapes: vec![PodShape {
            duplicates: 1,
            restarts_always: true,
            init_containers: vec![container(&hash_string("sh"), "")],
            containers: vec![container(&hash_string("etcd"), &hash_string("unknown"))],
          }],
          ..Default::default()
        },
      ),
      (
        hash_string("customer-secret"),
        NamespacePods {
          count: 1,
          invalid_count: 1,
          ..Default::default()
        },
      ),
    ]),
  }
}

#[test]
fn parse_options() {
  let options =
    Options::try_parse_from(["insights-workloadinfo", "--names", "n.txt", "-v", "a.json"])
      .unwrap();
  assert_eq!(Some(PathBuf::from("n.txt")), options.names);
  assert!(options.verbose);
  assert!(!options.extract_names);
  assert_eq!(Some(PathBuf::from("a.json")), options.archive);

  let options = Options::try_parse_from(["insights-workloadinfo", "--extract-names"]).unwrap();
  assert!(options.extract_names);
  assert_eq!(None, options.archive);
}

#[test]
fn dictionary_lines() {
  let mut dictionary = Dictionary::default();
  dictionary.add_lines("  node  \n\n# comment\n/opt/app/bin/server\nnode\n");

  assert_eq!(Some("node"), dictionary.get(&hash_string("node")));
  assert_eq!(
    Some("/opt/app/bin/server"),
    dictionary.get(&hash_string("/opt/app/bin/server"))
  );
  assert_eq!(
    Some("/opt/app/bin/server"),
    dictionary.get(&hash_string("server"))
  );
  assert_eq!(None, dictionary.get(&hash_string("# comment")));
  assert!(dictionary.collisions.is_empty());
  assert_eq!(3, dictionary.len());
}

#[test]
fn dictionary_collisions() {
  let mut dictionary = Dictionary::default();
  dictionary.add("node");
  dictionary.add("/usr/bin/node");

  assert_eq!(vec!["/usr/bin/node".to_string()], dictionary.collisions);
  assert_eq!(Some("node"), dictionary.get(&hash_string("node")));
}

#[test]
fn default_dictionary() {
  let dictionary = Dictionary::with_defaults();
  assert!(dictionary.collisions.is_empty());
  assert_eq!(Some("bash"), dictionary.get(&hash_string("bash")));
  assert_eq!(
    Some("openshift-etcd"),
    dictionary.get(&hash_string("openshift-etcd"))
  );
}

#[test]
fn stats_display() {
  assert_eq!(
    "75.0%(2+1/4)",
    ReplaceStats {
      replaced: 2,
      no_name: 1,
      total: 4,
    }
    .to_string()
  );
  assert_eq!("0.0%(0+0/0)", ReplaceStats::default().to_string());
}

#[test]
fn restores_names() {
  let mut workloads = archive();
  let mut dictionary = Dictionary::with_defaults();
  dictionary.add("custom-tool");

  let restored = restore(&mut workloads, &dictionary);

  assert_eq!("custom-tool", workloads.images["sha256:a"].first_command);
  assert_eq!("", workloads.images["sha256:b"].first_command);
  let etcd = &workloads.namespaces["openshift-etcd"];
  assert_eq!("sh", etcd.shapes[0].init_containers[0].first_command);
  assert_eq!("etcd", etcd.shapes[0].containers[0].first_command);
  assert_eq!(hash_string("unknown"), etcd.shapes[0].containers[0].first_arg);
  assert!(workloads.namespaces.contains_key(&hash_string("customer-secret")));

  assert_eq!(
    ReplaceStats {
      replaced: 1,
      no_name: 0,
      total: 2,
    },
    restored.namespaces
  );
  assert_eq!(
    ReplaceStats {
      replaced: 1,
      no_name: 1,
      total: 2,
    },
    restored.images
  );
  assert_eq!(1, restored.init_containers.replaced);
  assert_eq!(1, restored.containers.replaced);
  assert_eq!(
    vec!["custom-tool", "etcd", "openshift-etcd", "sh"],
    restored.names_seen.iter().collect::<Vec<_>>()
  );
}

#[test]
fn extracts_names() {
  let mut output = Vec::new();
  extract_names(
    "bash -c foo\n# comment\n\n-v\n/usr/bin/node # trailing\n".as_bytes(),
    &mut output,
  )
  .unwrap();
  assert_eq!(
    format!("{}\n{}\n", hash_string("bash"), hash_string("node")),
    String::from_utf8(output).unwrap()
  );
}

#[test]
fn run_with_names_file() {
  let directory = tempfile::tempdir().unwrap();
  let archive_path = directory.path().join("workload_info.json");
  std::fs::write(&archive_path, serde_json::to_vec(&archive()).unwrap()).unwrap();
  let names_path = directory.path().join("names.txt");
  std::fs::write(&names_path, "# customer names\ncustom-tool\ncustomer-secret\n").unwrap();

  let mut output = Vec::new();
  let mut errors = Vec::new();
  run(
    &options(Some(archive_path), Some(names_path), true),
    std::io::empty(),
    &mut output,
    &mut errors,
  )
  .unwrap();

  let restored: serde_json::Value = serde_json::from_slice(&output).unwrap();
  assert_eq!(
    json!("custom-tool"),
    restored["images"]["sha256:a"]["firstCommand"]
  );
  assert_eq!(json!(1), restored["namespaces"]["customer-secret"]["count"]);
  assert_eq!(
    "stats: namespaces=100.0%(2+0/2) images=100.0%(1+1/2) initContainers=100.0%(1+0/1) \
     containers=100.0%(1+0/1)\ninfo: names seen: custom-tool customer-secret etcd openshift-etcd \
     sh\n",
    String::from_utf8(errors).unwrap()
  );
}

#[test]
fn run_errors() {
  let mut output = Vec::new();
  let mut errors = Vec::new();
  assert_eq!(
    "expected one argument listing the name of a workload info file",
    run(
      &options(None, None, false),
      std::io::empty(),
      &mut output,
      &mut errors
    )
    .unwrap_err()
    .to_string()
  );

  let extract = Options {
    extract_names: true,
    ..options(Some(PathBuf::from("a.json")), None, false)
  };
  assert_eq!(
    "when --extract-names is specified arguments are not allowed",
    run(&extract, std::io::empty(), &mut output, &mut errors)
      .unwrap_err()
      .to_string()
  );

  let directory = tempfile::tempdir().unwrap();
  let broken = directory.path().join("broken.json");
  std::fs::write(&broken, "{").unwrap();
  let error = run(
    &options(Some(broken.clone()), None, false),
    std::io::empty(),
    &mut output,
    &mut errors,
  )
  .unwrap_err();
  assert_eq!(
    format!("unable to parse {}", broken.display()),
    error.to_string()
  );
  assert!(output.is_empty());
}
