// promguard - bitdrift's ACL enforcing proxy for Prometheus
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::Context;
use clap::Parser;
use log::info;
use promguard_proxy::acl::AclMap;
use promguard_proxy::config::Config;
use promguard_proxy::run_server;
use std::num::NonZeroUsize;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug, Clone)]
struct Options {
  #[arg(long = "config-check-and-exit")]
  pub config_check: bool,

  #[arg(long = "version")]
  pub version: bool,
}

fn main() -> anyhow::Result<()> {
  promguard_common::global_initialize();
  let opts = Options::parse();

  if opts.version {
    println!("promguard: {}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }

  let config = Config::from_env().context("unable to load config")?;

  if opts.config_check {
    AclMap::load_from_file(&config.acl_file)?;
    info!("configuration ok");
    return Ok(());
  }

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::new(1).unwrap()
  });
  log::info!("running server with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .unwrap();

  runtime.block_on(async {
    run_server(config, async {
      // Trap ctrl+c and sigterm messages and perform a clean shutdown
      let mut sigint = signal(SignalKind::interrupt()).unwrap();
      let mut sigterm = signal(SignalKind::terminate()).unwrap();
      select! {
        _ = sigint.recv() => info!("received sigint"),
        _ = sigterm.recv() => info!("received sigterm"),
      }
    })
    .await
  })
}
