#![deny(warnings)]

use {anyhow::Result, photos_server::Options, structopt::StructOpt};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    photos_server::serve(&Options::from_args()).await
}
