// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the conductor

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use conductor::run_server;
use conductor::Config;

#[derive(Debug, Parser)]
#[clap(name = "conductor", about = "Bare-metal provisioning conductor")]
struct Args {
    #[clap(long, action)]
    config_file: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file).with_context(|| {
        format!("loading config file {}", args.config_file)
    })?;
    run_server(&config)
        .await
        .map_err(|error_message| anyhow!("server exiting: {}", error_message))
}
