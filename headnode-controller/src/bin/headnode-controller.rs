// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the headnode controller

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use headnode_controller::run_controller;
use headnode_controller::Config;

#[derive(Debug, Parser)]
#[clap(
    name = "headnode-controller",
    about = "Provisions and configures virtual cluster headnodes"
)]
struct Args {
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(error) = do_run().await {
        eprintln!("headnode-controller: {:#}", error);
        std::process::exit(1);
    }
}

async fn do_run() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)
        .context("loading configuration")?;
    run_controller(config).await.map_err(|message| anyhow!(message))
}
