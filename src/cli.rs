//! Command line interface.

use std::collections::HashSet;

use anyhow::{bail, Result};
use http::Uri;
use structopt::StructOpt;

use crate::config::Config;
use crate::k8s::ApiGeneration;

/// Move running pods to a specific node, bypassing the cluster scheduler.
#[derive(Debug, StructOpt)]
#[structopt(name = "pod-mover")]
pub struct Opts {
    /// The namespace of the pods to move.
    #[structopt(long, default_value = "default")]
    pub namespace: String,
    /// The names of the pods to move, comma separated.
    #[structopt(long, required = true, use_delimiter = true)]
    pub pods: Vec<String>,
    /// The node to which the pods will be moved.
    #[structopt(long)]
    pub node: String,
    /// The name of a scheduler which does not exist, overriding SCHEDULER_NAME.
    #[structopt(long)]
    pub scheduler_name: Option<String>,
    /// The K8s version of the cluster, such as 1.5 or 1.22, overriding K8S_VERSION.
    #[structopt(long)]
    pub k8s_version: Option<ApiGeneration>,
    /// The URL of the K8s API server, overriding the server of any kubeconfig.
    #[structopt(long)]
    pub master_url: Option<Uri>,
    /// The path to a kubeconfig file, instead of the in-cluster or default config.
    #[structopt(long)]
    pub kubeconfig: Option<String>,
    /// Enable debug logging.
    #[structopt(short, long)]
    pub verbose: bool,
}

impl Opts {
    /// The names of the pods to move, without blanks or duplicates.
    pub fn pod_names(&self) -> Result<Vec<String>> {
        let names = dedup_names(self.pods.iter().cloned());
        if names.is_empty() {
            bail!("at least one pod name must be given via --pods");
        }
        Ok(names)
    }

    /// The destination node, which may not be blank.
    pub fn node_name(&self) -> Result<&str> {
        let node = self.node.trim();
        if node.is_empty() {
            bail!("a destination node must be given via --node");
        }
        Ok(node)
    }

    /// Override the given config with the values given on the command line.
    pub fn apply(&self, config: &mut Config) {
        if let Some(name) = self.scheduler_name.as_ref().filter(|name| !name.is_empty()) {
            config.scheduler_name = name.clone();
        }
        if let Some(generation) = self.k8s_version {
            config.k8s_version = generation;
        }
        if self.verbose {
            config.rust_log = "debug".into();
        }
    }
}

/// Trim the given names, dropping blanks & repeats while keeping the order of first appearance.
pub fn dedup_names<I: IntoIterator<Item = String>>(names: I) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}
