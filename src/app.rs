use crate::alarm::AlarmSender;
use crate::bus::Bus;
use crate::collector::Collector;
use crate::config::Config;
use crate::media::MediaRouter;
use crate::persistence::Persister;
use crate::tracer::Tracer;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct App {
    pub config: Arc<Config>,
}

pub struct AppBuilder {
    config: Option<Config>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(App {
            config: Arc::new(config),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Bring up the bus and the four workers and run until the token is
    /// cancelled or a worker hits a fatal condition.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let bus = Bus::new();
        let alarm = AlarmSender::new(&self.config.runtime);

        let collector = Collector::bind(self.config.clone(), bus.clone()).await?;
        let persister = Persister::new(self.config.clone(), bus.clone(), alarm.clone()).await?;
        let media = MediaRouter::new(self.config.clone(), bus.clone()).await?;
        let tracer = Tracer::new(self.config.clone(), bus.clone()).await?;

        info!("all workers configured, starting event loops");
        let persister_task = tokio::spawn(persister.run(token.clone()));
        let media_task = tokio::spawn(media.run(token.clone()));
        let tracer_task = tokio::spawn(tracer.run(token.clone()));
        let collector_task = tokio::spawn(collector.run(token.clone()));

        // The collector owns the only fatal runtime error path (ingress
        // socket loss, buffer overflow); everything else runs until cancel.
        let result = match collector_task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("collector task panicked: {}", err)),
        };

        token.cancel();
        let _ = tokio::join!(persister_task, media_task, tracer_task);
        result
    }
}
