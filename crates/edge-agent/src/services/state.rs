//! Device self-health reporting: one [`HealthRecord`](crate::model::HealthRecord) right
//! after start-up, then one per report interval, on the state-report topic.

use crate::health::HealthProbe;
use crate::messages::{AgentBus, AgentMessage};
use agent_framework::{Lifecycle, Service, ServiceState};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

pub struct StateService {
    lifecycle: Lifecycle,
    bus: AgentBus,
    probe: Box<dyn HealthProbe>,
    interval: Duration,
}

impl StateService {
    pub fn new(lifecycle: Lifecycle, bus: AgentBus, probe: Box<dyn HealthProbe>, interval: Duration) -> Self {
        Self {
            lifecycle,
            bus,
            probe,
            interval,
        }
    }

    fn report(&mut self) {
        let record = self.probe.sample();
        let delivered = self.bus.publish(AgentMessage::StateReport(record));
        debug!(delivered, "Health record published");
    }
}

#[async_trait]
impl Service for StateService {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn run(&mut self) {
        if self.lifecycle.startup().await.is_err() {
            return;
        }
        self.lifecycle.set_state(ServiceState::Normal);
        self.report();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval.max(Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.lifecycle.stopped() => break,
                _ = ticker.tick() => self.report(),
            }
        }
        self.lifecycle.set_state(ServiceState::NotRunning);
    }
}
