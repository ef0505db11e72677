//! Process wiring shared by the subcommands.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sensorbus_core::{
    Consumer, Publisher, PublisherConfig, PublisherTasks, SensorFile, SensorPoller, Transport,
};

/// Background tasks of one process, stopped together on shutdown.
pub struct Pipeline {
    cancel: CancellationToken,
    pollers: JoinSet<()>,
    publisher: Option<PublisherTasks>,
    consumer: Option<JoinHandle<()>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pollers: JoinSet::new(),
            publisher: None,
            consumer: None,
        }
    }

    /// Starts the publisher and one poller per configured sensor.
    pub fn start_producer(
        &mut self,
        sensors: &SensorFile,
        transport: Arc<dyn Transport>,
        topic: &str,
        config: PublisherConfig,
    ) -> Result<()> {
        let specs = sensors.specs().context("Invalid sensor configuration")?;
        let interval = sensors.interval();
        let (publisher, tasks) = Publisher::spawn(transport, topic, config);

        for (id, spec) in specs.into_iter().enumerate() {
            let poller = SensorPoller::new(id, spec, publisher.clone(), interval);
            self.pollers.spawn(poller.run(self.cancel.clone()));
        }
        info!(
            "Started {} pollers every {:?} publishing to {}",
            self.pollers.len(),
            interval,
            topic
        );

        self.publisher = Some(tasks);
        Ok(())
    }

    /// Runs the consumer until shutdown.
    pub fn start_consumer(&mut self, consumer: Consumer) {
        let cancel = self.cancel.clone();
        self.consumer = Some(tokio::spawn(async move { consumer.run(cancel).await }));
    }

    /// Stops pollers and consumer, then flushes what was already published.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        while let Some(joined) = self.pollers.join_next().await {
            if let Err(e) = joined {
                error!("Poller task failed: {}", e);
            }
        }
        // The pollers held the last publisher handles, so the buffer now drains and closes.
        if let Some(tasks) = self.publisher.take() {
            tasks.flush().await;
        }
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                error!("Consumer task failed: {}", e);
            }
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorbus_core::broker::InitialOffset;
    use sensorbus_core::{ConsumerConfig, MemoryBroker, MetricRegistry};
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_pipeline_end_to_end() {
        let dir = TempDir::new().unwrap();
        let zone = dir.path().join("thermal_zone0");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("temp"), "42000\n").unwrap();

        let config = format!(
            r#"
interval_ms = 20

[[sensors]]
pattern = "{}/thermal_zone*/temp"
name = "zone_temp"
help = "Thermal zone temperature"
divisor = 1000.0
"#,
            dir.path().display()
        );
        let sensors = SensorFile::from_toml_str(&config).unwrap();

        let broker = MemoryBroker::new(2);
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let mut pipeline = Pipeline::new();
        pipeline.start_consumer(Consumer::new(
            Box::new(broker.consumer_group("sensorbus", InitialOffset::Oldest)),
            registry.clone(),
            ConsumerConfig::new("sensors"),
        ));
        pipeline
            .start_producer(
                &sensors,
                Arc::new(broker.clone()),
                "sensors",
                PublisherConfig::default(),
            )
            .unwrap();

        let labels = BTreeMap::from([("origin".to_string(), "thermal_zone0".to_string())]);
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.value("zone_temp", &labels).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("measurement never reached the registry");
        assert_eq!(registry.value("zone_temp", &labels), Some(42.0));

        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .expect("shutdown hung");
    }

    #[tokio::test]
    async fn test_invalid_sensor_config_fails_startup() {
        let sensors = SensorFile::from_toml_str(
            r#"
[[sensors]]
pattern = "/sys/class/thermal/thermal_zone*/temp"
name = "zone temp"
help = "Thermal zone temperature"
"#,
        )
        .unwrap();

        let mut pipeline = Pipeline::new();
        let result = pipeline.start_producer(
            &sensors,
            Arc::new(MemoryBroker::new(1)),
            "sensors",
            PublisherConfig::default(),
        );
        assert!(result.is_err());
        pipeline.shutdown().await;
    }
}
