//! trunknet CNI plugin
//!
//! Invoked once per container lifecycle event by the container runtime:
//! the command arrives in `CNI_COMMAND`, the network configuration on
//! stdin, and the result leaves on stdout. Errors go to stderr as a CNI
//! error document with a non-zero exit.

use std::env;
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;

use tracing::{error, info, Level};

use trunknet_cni::attach::{self, AttachRequest};
use trunknet_cni::config::{self, NetworkConfig, PluginConfig};
use trunknet_cni::error::{CniError, CniErrorCode};
use trunknet_cni::podmeta;
use trunknet_cni::result::{CniResult, VersionResult};
use trunknet_cni::store::EtcdStore;
use trunknet_cni::vlan::TableVlanPolicy;

/// Maximum size of the network config input
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI spec version this plugin speaks
const CNI_VERSION: &str = "0.4.0";

/// Supported CNI versions; GET exists only in the pre-1.0 contract
const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0"];

fn main() {
    if let Err(e) = run() {
        error!(code = e.code() as u32, msg = %e.message(), "invocation failed");

        let error_output = serde_json::json!({
            "cniVersion": CNI_VERSION,
            "code": e.code() as u32,
            "msg": e.message(),
            "details": e.details()
        });
        eprintln!(
            "{}",
            serde_json::to_string(&error_output).unwrap_or_else(|_| {
                format!(
                    r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                    CNI_VERSION,
                    e.code() as u32,
                    e.message()
                )
            })
        );
        std::process::exit(1);
    }
}

fn run() -> Result<(), CniError> {
    let command = env::var("CNI_COMMAND").map_err(|_| {
        CniError::new(CniErrorCode::InvalidEnvironmentVariables, "CNI_COMMAND not set")
    })?;

    let mut input = String::new();
    io::stdin().take(MAX_INPUT_SIZE).read_to_string(&mut input).map_err(|e| {
        CniError::io_error("failed to read stdin").with_details(&e.to_string())
    })?;

    // VERSION needs neither host configuration nor a network config
    if command == "VERSION" {
        return cmd_version();
    }

    let plugin_config = PluginConfig::load()?;
    init_logging(&plugin_config);

    let netconf = NetworkConfig::parse(&input)?;
    check_version(&netconf.cni_version)?;

    match command.as_str() {
        "ADD" => cmd_add(&netconf, &plugin_config),
        "DEL" => cmd_del(&plugin_config),
        "GET" => cmd_get(&netconf, &plugin_config),
        _ => {
            // truncate and sanitize before echoing into the error
            let safe_command: String = command
                .chars()
                .take(32)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                &format!("unknown CNI_COMMAND: {}", safe_command),
            ))
        }
    }
}

/// Attach the container: resolve pod metadata, draw an address, wire
/// the namespace onto its VLAN, and print the IP configuration
fn cmd_add(netconf: &NetworkConfig, plugin_config: &PluginConfig) -> Result<(), CniError> {
    let container_id = require_env("CNI_CONTAINERID")?;
    let netns_path = require_env("CNI_NETNS")?;
    let ifname = require_env("CNI_IFNAME")?;
    let args = config::parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default())?;

    let pod_name = require_arg(&args, config::ARG_POD_NAME)?;
    let pod_namespace = require_arg(&args, config::ARG_POD_NAMESPACE)?;

    info!(
        container = %container_id,
        pod = %format!("{}/{}", pod_namespace, pod_name),
        netns = %netns_path,
        "handling ADD"
    );

    let pod_spec = podmeta::fetch(&plugin_config.kubeconfig, pod_namespace, pod_name)?;
    let policy = TableVlanPolicy::from_table(&plugin_config.vlans)?;
    let store = EtcdStore::open(&plugin_config.store)?;

    let req = AttachRequest {
        container_id: &container_id,
        netns_path: &netns_path,
        container_ifname: &ifname,
        parent_interface: netconf.parent_interface(plugin_config),
        group: &pod_spec.group,
        candidates: &pod_spec.candidates,
    };

    let record = attach::attach(&store, &policy, &req)?;

    let mut result = record.to_result(&netconf.cni_version);
    if let Some(dns) = netconf.dns.clone() {
        result.dns = Some(dns.into());
    }
    print_result(&result)
}

/// Detach the container; prints nothing on success
fn cmd_del(plugin_config: &PluginConfig) -> Result<(), CniError> {
    let container_id = require_env("CNI_CONTAINERID")?;

    info!(container = %container_id, "handling DEL");

    let store = EtcdStore::open(&plugin_config.store)?;
    attach::detach(&store, &container_id)
}

/// Report the recorded attachment without touching the host
fn cmd_get(netconf: &NetworkConfig, plugin_config: &PluginConfig) -> Result<(), CniError> {
    let container_id = require_env("CNI_CONTAINERID")?;

    let store = EtcdStore::open(&plugin_config.store)?;
    let record = attach::query(&store, &container_id)?;

    print_result(&record.to_result(&netconf.cni_version))
}

fn cmd_version() -> Result<(), CniError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    println!(
        "{}",
        serde_json::to_string(&result).map_err(|e| {
            CniError::io_error("failed to serialize version").with_details(&e.to_string())
        })?
    );

    Ok(())
}

fn check_version(requested: &str) -> Result<(), CniError> {
    if SUPPORTED_VERSIONS.contains(&requested) {
        Ok(())
    } else {
        Err(CniError::new(
            CniErrorCode::IncompatibleVersion,
            &format!("unsupported cniVersion {}", requested),
        ))
    }
}

fn require_env(name: &str) -> Result<String, CniError> {
    env::var(name).map_err(|_| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            &format!("{} not set", name),
        )
    })
}

fn require_arg<'a>(
    args: &'a std::collections::HashMap<String, String>,
    key: &str,
) -> Result<&'a str, CniError> {
    args.get(key).map(String::as_str).ok_or_else(|| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            &format!("CNI_ARGS missing {}", key),
        )
    })
}

fn print_result(result: &CniResult) -> Result<(), CniError> {
    println!(
        "{}",
        serde_json::to_string(result).map_err(|e| {
            CniError::io_error("failed to serialize result").with_details(&e.to_string())
        })?
    );
    Ok(())
}

/// Point the subscriber at the configured log file
///
/// Stdout carries the result document and stderr the error document,
/// so logs cannot share either; stderr is only the fallback when the
/// file cannot be opened.
fn init_logging(config: &PluginConfig) {
    let level = config.log.level.parse::<Level>().unwrap_or(Level::INFO);

    if let Some(parent) = config.log.file.parent() {
        let _ = fs::create_dir_all(parent);
    }

    match fs::OpenOptions::new().create(true).append(true).open(&config.log.file) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(io::stderr)
                .init();
        }
    }
}
