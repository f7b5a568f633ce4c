mod args;
mod config;
mod error;
mod household;
mod limit;
mod logger;
mod pool;
mod server;
mod shutdown;
mod supervisor;
mod worker;

use std::error::Error;

use clap::Parser;

use args::{Command, ServerArgs};

fn main() -> Result<(), Box<dyn Error>> {
    let args = ServerArgs::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match args.command.as_ref() {
            Some(Command::Worker(worker_args)) => {
                logger::init_logging(worker_args.verbose);
                worker::run(worker_args).await?;
            }
            None => {
                logger::init_logging(args.verbose);
                server::run(&args).await?;
            }
        }
        Ok(())
    })
}
