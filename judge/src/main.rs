use std::{process::exit, sync::Arc};

use clap::Parser;
use gavel_judge::{
    config::ServeConfig, sandbox::HostSandbox, service::ExecService, store::FileStore,
};
use tokio::net::TcpListener;

mod opt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    ctrlc::set_handler(handle_ctrl_c).expect("Failed to set termination handler!");

    let opts = opt::Opts::parse();
    match opts.cmd {
        opt::SubCmd::Serve(cmd) => serve(cmd).await,
    }
}

async fn serve(cmd: opt::ServeSubCmd) {
    let file_cfg = match &cmd.config {
        Some(path) => match ServeConfig::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to read config file {:?}: {}", path, e);
                exit(2);
            }
        },
        None => ServeConfig::default(),
    };

    let listen = cmd
        .listen
        .or(file_cfg.listen)
        .unwrap_or_else(|| "0.0.0.0:9090".into());
    let token = match cmd.token.or(file_cfg.token) {
        Some(token) => token,
        None => {
            eprintln!("A bearer token is required (--token or the config file).");
            exit(2);
        }
    };
    let store_root = cmd
        .store
        .or(file_cfg.store)
        .unwrap_or_else(|| "judge-store".into());
    let wrapper = cmd
        .wrapper
        .or(file_cfg.wrapper)
        .unwrap_or_else(|| "run_boxed.sh".into());

    let store = FileStore::new(&store_root).expect("Failed to open blob store");
    let backend = HostSandbox::new(wrapper).expect("Failed to connect to Docker");
    let listener = TcpListener::bind(&listen)
        .await
        .expect("Failed to bind listen address");
    tracing::info!("execution service listening on {}", listen);

    let service = Arc::new(ExecService::new(store, token, Arc::new(backend)));
    if let Err(e) = service.serve(listener).await {
        tracing::error!("accept loop failed: {}", e);
        exit(1);
    }
}

fn handle_ctrl_c() {
    log::warn!("Received interrupt, shutting down.");
    exit(0);
}
