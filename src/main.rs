use anyhow::Result;
use callstream::app::AppBuilder;
use callstream::config::{Cli, Config};
use clap::Parser;
use std::fs::File;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conf_path = cli
        .conf
        .or_else(|| std::env::var("CALLSTREAMSERVER_CONF_FILE").ok());
    let config = match conf_path {
        Some(path) => Config::load(&path)?,
        None => {
            let mut config = Config::default();
            config.runtime = callstream::config::RuntimeEnv::from_env();
            config
        }
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = guard;
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = AppBuilder::new().config(config).build()?;
    let token = CancellationToken::new();

    info!(
        ingress = %app.config.collector.log_server_endpoint.ip,
        port = app.config.collector.log_server_endpoint.port,
        "starting callstream"
    );
    select! {
        result = app.run(token.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received CTRL+C, shutting down");
            token.cancel();
        }
    }
    Ok(())
}
