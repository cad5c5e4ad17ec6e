//! A standalone demo binary that drives the `overlay` driver directly,
//! the way `play` drives raw `ip`/`tc` commands: no host daemon, no
//! plugin protocol, just enough CLI to create a network, join a handful
//! of "container" namespaces onto it, and tear everything back down on
//! Ctrl-C. It exercises the library's public API end to end, not the
//! networking primitives in isolation, so it needs `CAP_NET_ADMIN` and a
//! real Linux kernel to do anything useful.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser};
use crossbeam::channel::Receiver;
use ipnet::Ipv4Net;
use overlay::driver::{Config, CreateNetworkOptions};
use overlay::external::InMemoryTableLayer;
use overlay::kv::MemoryStore;
use overlay::network::SubnetSpec;
use overlay::Driver;
use tracing::metadata::LevelFilter;

#[derive(Debug, Parser)]
#[command(
    name = "overlay-harness",
    about = "bring up an overlay network and join a handful of namespaces onto it, for manual testing."
)]
struct Opt {
    #[clap(long, short = 'n', help = "network id")]
    network: String,

    #[clap(long, default_value = "10.0.1.0/24", help = "subnet for the network's single VNI")]
    subnet: Ipv4Net,

    #[clap(long, default_value_t = 4097, help = "VNI for the subnet")]
    vni: u32,

    #[clap(long, short = 'c', default_value_t = 2, help = "number of namespaces to join onto the network")]
    count: usize,

    #[clap(long, help = "require IPsec encryption on the network; a key must be supplied with --key")]
    secure: bool,

    #[clap(long, help = "hex-encoded 36-byte (salt||key) SA key, required if --secure is set")]
    key: Option<String>,

    #[clap(long, help = "do not tear down namespaces and the network on exit")]
    no_revert: bool,
}

fn main() {
    let opts = Opt::parse();
    let mut cmd = Opt::command();

    if opts.secure && opts.key.is_none() {
        cmd.error(ErrorKind::MissingRequiredArgument, "--secure requires --key").exit();
    }

    if let Err(e) = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
            .finish(),
    ) {
        cmd.error(ErrorKind::Io, format!("failed to set global default subscriber: {:?}", e)).exit();
    }

    let (rx, tx) = crossbeam::channel::unbounded::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received interrupt, tearing down");
        _ = rx.send(());
    }) {
        cmd.error(ErrorKind::Io, format!("failed to set interrupt handler: {:?}", e)).exit();
    }

    if let Err(err) = run(&opts, tx) {
        cmd.error(ErrorKind::Io, format!("{:?}", err)).exit();
    }
}

/// One simulated container: a bare network namespace created with `ip netns
/// add`, destroyed on drop-equivalent cleanup. Standing in for whatever
/// sandbox the real container runtime would have already created before
/// calling `Join`.
struct ContainerNs {
    name: String,
}

impl ContainerNs {
    fn create(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        run_ip(&["netns", "add", &name]).with_context(|| format!("ip netns add {}", name))?;
        Ok(ContainerNs { name })
    }

    fn path(&self) -> PathBuf {
        PathBuf::from(format!("/var/run/netns/{}", self.name))
    }

    fn destroy(&self) {
        if let Err(err) = run_ip(&["netns", "del", &self.name]) {
            tracing::warn!(name = %self.name, error = %err, "failed to remove container namespace");
        }
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip").args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).output().context("spawning ip")?;
    if !output.status.success() {
        anyhow::bail!("ip {}: {}", args.join(" "), String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

fn run(opts: &Opt, stop: Receiver<()>) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let table_layer = Arc::new(InMemoryTableLayer::new());
    let driver = Driver::new(Config::new(store, table_layer));
    driver.start_periodic_sweep();

    let subnet = SubnetSpec { cidr: opts.subnet, gateway: first_host(opts.subnet), vni: opts.vni };
    driver
        .create_network(&opts.network, CreateNetworkOptions { subnets: vec![subnet], secure: opts.secure, mtu: None })
        .context("create network")?;

    if opts.secure {
        let key_bytes = hex_decode(opts.key.as_deref().unwrap()).context("decoding --key")?;
        driver.configure_encryption_keys(overlay::external::EncryptionKeysConfig {
            keys: vec![overlay::external::EncryptionKey { tag: 1, bytes: key_bytes }],
        });
    }

    let mut hosts = opts.subnet.hosts();
    hosts.next(); // gateway
    let mut containers = Vec::new();
    let mut joined = Vec::new();

    let result = (|| -> Result<()> {
        for i in 0..opts.count {
            let eid = format!("e{}", i);
            let ip = hosts.next().ok_or_else(|| anyhow::anyhow!("subnet exhausted after {} endpoints", i))?;
            let endpoint_ip = ipnet::IpNet::new(ip.into(), opts.subnet.prefix_len()).context("building endpoint ip")?;
            driver.create_endpoint(&opts.network, &eid, endpoint_ip, None).context("create endpoint")?;

            let ns_name = format!("{}-{}", opts.network, i);
            let ns = ContainerNs::create(ns_name)?;
            let info = driver.join(&opts.network, &eid, &ns.path()).context("join")?;
            tracing::info!(eid = %eid, interface = %info.interface_name, gateway = %info.gateway, "joined");
            containers.push(ns);
            joined.push(eid);
        }

        tracing::info!(network = %opts.network, count = opts.count, "overlay network is up, waiting for interrupt");
        _ = stop.recv();
        Ok(())
    })();

    if !opts.no_revert {
        for eid in joined.iter().rev() {
            if let Err(err) = driver.leave(&opts.network, eid) {
                tracing::error!(eid = %eid, error = %err, "leave failed during teardown");
            }
            if let Err(err) = driver.delete_endpoint(&opts.network, eid) {
                tracing::error!(eid = %eid, error = %err, "delete_endpoint failed during teardown");
            }
        }
        for ns in containers.iter().rev() {
            ns.destroy();
        }
        if let Err(err) = driver.delete_network(&opts.network) {
            tracing::error!(error = %err, "delete_network failed during teardown");
        }
    }
    driver.stop_periodic_sweep();
    result
}

fn first_host(net: Ipv4Net) -> std::net::Ipv4Addr {
    net.hosts().next().unwrap_or_else(|| net.network())
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).with_context(|| format!("invalid hex byte at offset {}", i)))
        .collect()
}
