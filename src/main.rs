use anyhow::Context;
use clap::Parser;
use kafka_injector::{
    health,
    ingester::Ingester,
    pipeline::Pipeline,
    registry,
    settings::Settings,
    sink,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::new(&args.config).expect("cannot load config");
    let cancel = CancellationToken::new();

    let mut ingesters = JoinSet::new();
    let mut stores = Vec::new();
    for (name, cfg) in settings.ingesters {
        let resolver = registry::from_settings(&cfg)
            .unwrap_or_else(|e| panic!("failed to create schema resolver for {name}: {:#}", e));
        let store = sink::from_settings(&cfg.sink)
            .unwrap_or_else(|e| panic!("failed to create store for {name}: {:#}", e));
        stores.push(store.clone());
        let pipeline = Pipeline::new(resolver).strict_marker(cfg.strict_marker);
        let mut ingester = Ingester::new(&name, &cfg, pipeline, store, cancel.clone())
            .unwrap_or_else(|e| panic!("failed to create ingester {name}: {:#}", e));
        let stop_all = cancel.clone();
        ingesters.spawn(async move {
            let res = ingester.start().await;
            if res.is_err() {
                stop_all.cancel();
            }
            res
        });
    }

    let bind = settings
        .health_bind
        .unwrap_or_else(|| String::from("0.0.0.0:8080"));
    let router = health::router(stores, cancel.clone());
    let health_cancel = cancel.clone();
    ingesters.spawn(async move {
        info!("serving readiness on {bind}");
        health::serve(router, &bind, health_cancel)
            .await
            .context("readiness endpoint failed")
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("listening for shutdown signal: {e}"),
        }
    });

    let mut failed = false;
    while let Some(res) = ingesters.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{e:#}");
                failed = true;
            }
            Err(e) => {
                error!("task failed: {e}");
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}
