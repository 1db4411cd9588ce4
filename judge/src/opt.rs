use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(name = "gavel")]
pub struct Opts {
    #[clap(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run as a long-lived execution-service host
    #[clap(name = "serve")]
    Serve(ServeSubCmd),
}

#[derive(Args, Debug, Clone)]
pub struct ServeSubCmd {
    /// Address to listen on, defaults to 0.0.0.0:9090
    #[clap(long)]
    pub listen: Option<String>,

    /// Shared bearer token judging masters must present
    #[clap(long, short)]
    pub token: Option<String>,

    /// Root directory of the blob store, defaults to ./judge-store
    #[clap(long)]
    pub store: Option<PathBuf>,

    /// Wrapper script used for restricted-process sandboxes,
    /// defaults to ./run_boxed.sh
    #[clap(long)]
    pub wrapper: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[clap(long, short)]
    pub config: Option<PathBuf>,
}
