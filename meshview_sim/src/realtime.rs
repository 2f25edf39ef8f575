//! Real-time mode: one engine paced against a clock, bus traffic printed as
//! it arrives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshview_core::model::{ChainId, ScenarioStatus};
use meshview_core::{
    AccountRole, Amount, Axis, BusMessage, Engine, Envelope, GenerationRequest, SharedEngine,
    Subscription,
};
use meshview_env::{Pacer, SeededRandom};
use serde::Serialize;
use tracing::info;

use crate::error::SimResult;
use crate::recorder::ALL_TOPICS;
use crate::world::SimConfig;

/// What a real-time session did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RealtimeSummary {
    pub dispatched: usize,
    pub messages: usize,
    pub results: usize,
    pub final_time_secs: f64,
}

/// One line per message, for humans.
pub fn describe(message: &BusMessage) -> String {
    match message {
        BusMessage::Monitoring(s) => {
            let top = s.nodes.iter().map(|n| n.height).max().unwrap_or(0);
            let pending: u64 = s.mempool.iter().map(|g| g.pending_count).sum();
            format!(
                "{} nodes, {} replicas, height {}, {} pending tx",
                s.nodes.len(),
                s.replica_count,
                top,
                pending
            )
        }
        BusMessage::Packet(p) => format!("{:?} {} -> {}", p.kind, p.from, p.to),
        BusMessage::Deployment(l) => format!(
            "[{}] {:?} {}",
            l.job,
            l.kind,
            l.message.as_deref().unwrap_or("")
        ),
        BusMessage::Experiment(p) => match (p.kind, &p.scenario_id) {
            (Some(_), _) => format!(
                "all complete: {} succeeded, {} failed",
                p.succeeded.unwrap_or(0),
                p.failed.unwrap_or(0)
            ),
            (None, Some(id)) => format!(
                "{} {} {}",
                id,
                p.status.map_or_else(|| "-".to_string(), |s| s.to_string()),
                p.log.as_deref().unwrap_or("")
            ),
            (None, None) => "progress".to_string(),
        },
        BusMessage::Scenario(u) => match (u.sequence_id, u.status) {
            (Some(seq), Some(status)) => match u.reason {
                Some(reason) => format!("#{seq} {status} ({reason})"),
                None => format!("#{seq} {status}"),
            },
            _ => format!(
                "classified {} scenarios, {} failed",
                u.total.unwrap_or(0),
                u.failed.unwrap_or(0)
            ),
        },
    }
}

/// Runs a demo session: heartbeat, a build, a deploy, then one batch
/// generated, classified and executed, all paced by `pacer`.
pub async fn run_realtime<P: Pacer + ?Sized>(
    config: &SimConfig,
    pacer: &P,
    json: bool,
) -> SimResult<RealtimeSummary> {
    let engine = Engine::new(config.engine_config(), SeededRandom::new(config.seed))?;
    let shared = SharedEngine::new(engine);
    let bus = shared.bus();

    let messages = Arc::new(AtomicUsize::new(0));
    let subscriptions: Vec<Subscription> = ALL_TOPICS
        .iter()
        .map(|topic| {
            let counter = Arc::clone(&messages);
            bus.subscribe(topic, move |envelope: &Envelope| {
                counter.fetch_add(1, Ordering::Relaxed);
                if json {
                    println!("{}", serde_json::to_string(envelope)?);
                } else {
                    info!(topic = %envelope.topic, "{}", describe(&envelope.message));
                }
                Ok(())
            })
        })
        .collect();

    let replicas = config.replicas;
    let (account, batch) = shared.with(|engine| -> SimResult<_> {
        engine.start();
        let account = engine.create_user(AccountRole::Client)?;
        engine.faucet(account.id, Amount::from_tokens(1_000))?;
        engine.build_image();
        engine.deploy(replicas)?;
        let batch = engine.generate_batch(GenerationRequest {
            project: "live".to_string(),
            account: account.id,
            data_size_mb: Axis::List(vec![50, 100]),
            chunk_size_kb: Axis::Fixed(256),
            allocators: vec!["round_robin".to_string()],
            transmitters: vec!["direct".to_string(), "relay".to_string()],
            target_chains: [ChainId(1)].into_iter().collect(),
        })?;
        Ok((account.id, batch))
    })?;
    info!(account = %account, batch = %batch, "demo workload submitted");

    let total = config.duration();
    let classify = Duration::from_millis(
        config.engine.scenarios.classify_step_ms.saturating_mul(4).saturating_add(1),
    )
    .min(total);
    let mut dispatched = shared.run_paced(pacer, classify).await?;

    let ready = shared.with(|engine| {
        engine
            .batch(batch)
            .map(|b| b.count(ScenarioStatus::Ready))
            .unwrap_or(0)
    });
    if ready > 0 {
        let exec = shared.with(|engine| engine.execute_batch(batch))?;
        info!(execution = %exec, ready, "executing batch");
    }
    dispatched += shared.run_paced(pacer, total).await?;

    let summary = shared.with(|engine| {
        engine.shutdown();
        RealtimeSummary {
            dispatched,
            messages: messages.load(Ordering::Relaxed),
            results: engine.results().len(),
            final_time_secs: engine.now().as_secs_f64(),
        }
    });
    for token in subscriptions {
        bus.unsubscribe(token);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshview_core::messages::{DeploymentLog, JobKind};
    use meshview_env::{JobId, VirtualPacer};

    #[tokio::test]
    async fn test_session_on_virtual_pacer() {
        let config = SimConfig {
            max_duration_secs: 20.0,
            ..Default::default()
        };
        let pacer = VirtualPacer::new();
        let summary = run_realtime(&config, &pacer, false).await.unwrap();

        assert_eq!(summary.final_time_secs, 20.0);
        assert!(summary.dispatched > 0);
        assert!(summary.messages > 20);
        assert_eq!(pacer.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn test_describe_deploy_line() {
        let job = JobId::from_seed(1);
        let line = describe(&BusMessage::Deployment(DeploymentLog::line(
            job,
            JobKind::Deploy,
            "Scheduled replica on data-1",
        )));
        assert!(line.contains("Scheduled replica on data-1"));
    }
}
