//! Operator tool for the host's affinity state.
//!
//! ```text
//! affinity_ctl topology [--profile <name>]       describe sockets/NUMA/ledger
//! affinity_ctl dump [--test]                     lock-free ledger dump
//! affinity_ctl acquire <n> [--timeout <sec>] [--verify] [--test]
//! affinity_ctl release <spec> [--timeout <sec>] [--test]
//! affinity_ctl clean [--test]                    remove shared kernel objects
//! ```
//!
//! `--test` targets the isolated test keys, never production state.

use std::env;

use anyhow::{bail, Context};
use packgrid::AffinityManager;
use tracing_subscriber::EnvFilter;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_switch(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!("usage: affinity_ctl <topology|dump|acquire|release|clean> [options]");
    };
    let rest = &args[1..];
    let test_mode = has_switch(rest, "--test");
    let timeout: f32 = parse_flag(rest, "--timeout")
        .map(|v| v.parse().context("bad --timeout"))
        .transpose()?
        .unwrap_or(10.0);

    match command.as_str() {
        "topology" => {
            let profile = parse_flag(rest, "--profile").unwrap_or_else(|| "localhost".into());
            let mgr = AffinityManager::with_profile(&profile, test_mode)?;
            print!("{}", mgr.describe_topology());
        }
        "dump" => {
            let mgr = AffinityManager::new(test_mode)?;
            print!("{}", mgr.dump_ledger());
        }
        "acquire" => {
            let n: u32 = rest
                .first()
                .context("acquire needs a core count")?
                .parse()
                .context("bad core count")?;
            let verify = has_switch(rest, "--verify");
            let mut mgr = AffinityManager::new(test_mode)?;
            let spec = mgr.acquire(n, timeout, verify)?;
            println!("{spec}");
        }
        "release" => {
            let spec = rest.first().context("release needs a core id spec")?;
            let mut mgr = AffinityManager::new(test_mode)?;
            mgr.release(spec, timeout)?;
        }
        "clean" => {
            AffinityManager::remove_shared_state(test_mode)?;
        }
        other => bail!("unknown command {other:?}"),
    }
    Ok(())
}
