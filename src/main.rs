mod analysis;
mod cancel;
mod cli;
mod config;
mod context;
mod correct;
mod diagnose;
mod files;
mod installed;
mod item;
mod logging;
mod missing;
mod network;
mod report;
mod rules;
mod sort;
mod source;
mod store;
#[cfg(test)]
mod testing;
mod translations;
mod tree;
mod worker;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
