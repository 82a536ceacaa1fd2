//! End-to-end channel scenarios
//!
//! Each scenario drives a [`ChannelScenario`] through joins, negotiation and
//! departures and checks the resulting tree. They run against a registry
//! that yields at every call, so concurrent operations really interleave.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use relaytree_core::{ErrorKind, LinkFilter, PeerId, RelayResult};
use relaytree_runtime::CoordinatorConfig;

use crate::harness::ChannelScenario;

/// Outcome of a churn run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChurnReport {
    pub joins: usize,
    pub rejected: usize,
    pub leaves: usize,
    pub rejoins: usize,
    pub violations: Vec<String>,
}

impl ChurnReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Random joins, departures and re-joins of orphaned viewers
///
/// Invariants are checked after every step; the run stops at the first
/// violation.
pub async fn run_churn(seed: u64, steps: usize) -> RelayResult<ChurnReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scenario = ChannelScenario::start(CoordinatorConfig::default()).await?;
    let mut report = ChurnReport::default();

    for step in 0..steps {
        let viewers: Vec<PeerId> = scenario
            .peers()
            .into_iter()
            .filter(|p| *p != scenario.broadcaster())
            .collect();

        match rng.gen_range(0..10) {
            0..=4 => match scenario.join().await {
                Ok(joined) => {
                    report.joins += 1;
                    if let Some(link) = joined.link {
                        if rng.gen_bool(0.8) {
                            scenario.negotiate(&link).await?;
                        } else {
                            scenario.start_negotiation(&link).await?;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NoCapacity => report.rejected += 1,
                Err(e) => return Err(e),
            },
            5..=6 => {
                if let Some(peer) = viewers.choose(&mut rng).copied() {
                    scenario.leave(peer).await?;
                    report.leaves += 1;
                }
            }
            _ => {
                let mut orphans = Vec::new();
                for peer in &viewers {
                    let parents = scenario
                        .coordinator()
                        .parent_links(*peer, LinkFilter::Any)
                        .await?;
                    if parents.is_empty() {
                        orphans.push(*peer);
                    }
                }

                if let Some(peer) = orphans.choose(&mut rng).copied() {
                    match scenario.rejoin(peer).await {
                        Ok(joined) => {
                            report.rejoins += 1;
                            if let Some(link) = joined.link {
                                scenario.negotiate(&link).await?;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::NoCapacity => report.rejected += 1,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let violations = scenario.check_invariants().await?;
        if !violations.is_empty() {
            tracing::warn!(seed, step, ?violations, "churn invariant violated");
            report.violations = violations;
            break;
        }
    }

    Ok(report)
}
