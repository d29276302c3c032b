use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_GATHER_TIMEOUT;
use crate::peer::engine::PeerConnection;
use crate::peer::types::GatheringState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOutcome {
    /// Сбор завершился (или уже был завершён)
    Complete,
    TimedOut,
    /// Соединение закрыто, уведомлений больше не будет
    Abandoned,
}

/// Ждёт окончания сбора ICE кандидатов, но не дольше таймаута.
///
/// На сетях с симметричным NAT без TURN сбор может так и не завершиться
/// формально, поэтому код всё равно выдаётся за ограниченное время.
#[derive(Debug, Clone, Copy)]
pub struct IceGatheringGate {
    timeout: Duration,
}

impl Default for IceGatheringGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATHER_TIMEOUT)
    }
}

impl IceGatheringGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn wait(&self, pc: &dyn PeerConnection) -> GatherOutcome {
        self.wait_on(pc.gathering_state()).await
    }

    /// Результат один: либо Complete, либо таймаут, что бы ни пришло раньше
    pub async fn wait_on(&self, mut state: watch::Receiver<GatheringState>) -> GatherOutcome {
        if *state.borrow_and_update() == GatheringState::Complete {
            debug!("ICE gathering already complete");
            return GatherOutcome::Complete;
        }

        match timeout(self.timeout, state.wait_for(|s| *s == GatheringState::Complete)).await {
            Ok(Ok(_)) => {
                debug!("ICE gathering completed");
                GatherOutcome::Complete
            }
            Ok(Err(_)) => {
                warn!("ICE gathering state source dropped before completion");
                GatherOutcome::Abandoned
            }
            Err(_) => {
                info!(
                    "ICE gathering did not complete within {} ms, using candidates so far",
                    self.timeout.as_millis()
                );
                GatherOutcome::TimedOut
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Считает кандидатов, попавших в SDP
pub fn analyze_candidates(sdp: &str) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        if line.contains("typ host") {
            summary.host += 1;
        } else if line.contains("typ srflx") {
            summary.srflx += 1;
        } else if line.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );
    if summary.srflx == 0 && summary.relay == 0 {
        warn!("No server-reflexive or relay candidates, only peers on the same LAN can connect");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn resolves_immediately_when_already_complete() {
        let (_tx, rx) = watch::channel(GatheringState::Complete);
        let gate = IceGatheringGate::new(Duration::from_secs(3));

        let started = Instant::now();
        assert_eq!(gate.wait_on(rx).await, GatherOutcome::Complete);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_not_before_deadline() {
        let (tx, rx) = watch::channel(GatheringState::Gathering);
        let gate = IceGatheringGate::new(Duration::from_millis(3000));

        let started = Instant::now();
        assert_eq!(gate.wait_on(rx).await, GatherOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(3000));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_wins_over_timeout() {
        let (tx, rx) = watch::channel(GatheringState::New);
        let gate = IceGatheringGate::new(Duration::from_secs(3));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send_replace(GatheringState::Gathering);
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send_replace(GatheringState::Complete);
            // второе уведомление не должно ничего сломать
            tx.send_replace(GatheringState::Complete);
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let started = Instant::now();
        assert_eq!(gate.wait_on(rx).await, GatherOutcome::Complete);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn dropped_source_is_abandoned() {
        let (tx, rx) = watch::channel(GatheringState::Gathering);
        drop(tx);
        let gate = IceGatheringGate::new(Duration::from_secs(3));
        assert_eq!(gate.wait_on(rx).await, GatherOutcome::Abandoned);
    }

    #[test]
    fn counts_candidate_types() {
        let sdp = "v=0\r\n\
            a=candidate:1 1 udp 2130706431 192.168.1.2 5000 typ host\r\n\
            a=candidate:2 1 udp 1694498815 203.0.113.9 6000 typ srflx raddr 0.0.0.0 rport 0\r\n\
            a=candidate:3 1 udp 16777215 198.51.100.1 7000 typ relay raddr 0.0.0.0 rport 0\r\n\
            a=candidate:4 1 udp 2130706431 10.0.0.2 5001 typ host\r\n";
        assert_eq!(
            analyze_candidates(sdp),
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}
