//! Independent uniform sampling.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::space::ParameterSpace;
use crate::strategy::{Candidate, Observation, SearchPhase, SearchStrategy, StopReason, TrialBudget};

/// Independent random sampling across the parameter space, one candidate per
/// proposal. Reproducible for a fixed seed.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: ParameterSpace,
    rng: ChaCha8Rng,
    budget: TrialBudget,
}

impl RandomSearch {
    pub fn new(space: ParameterSpace, max_trials: usize, seed: u64) -> Self {
        Self {
            space,
            rng: ChaCha8Rng::seed_from_u64(seed),
            budget: TrialBudget::new(max_trials),
        }
    }

    pub fn max_trials(&self) -> usize {
        self.budget.max_trials
    }
}

impl SearchStrategy for RandomSearch {
    fn name(&self) -> &str {
        "random"
    }

    fn phase(&self) -> SearchPhase {
        self.budget.phase()
    }

    fn propose(&mut self) -> Vec<Candidate> {
        match self.budget.next_trial() {
            Some(trial_number) => vec![Candidate {
                trial_number,
                params: self.space.sample(&mut self.rng),
            }],
            None => Vec::new(),
        }
    }

    fn observe(&mut self, candidate: &Candidate, observation: Observation) {
        debug!(
            trial = candidate.trial_number,
            loss = observation.loss(),
            "random search observation"
        );
        self.budget.record();
    }

    fn should_stop(&self) -> bool {
        self.budget.exhausted()
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.budget.stop_reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ParameterSpace {
        ParameterSpace::new()
            .add_linear("speed", 0.2, 2.5)
            .add_log("prune_prob", 1e-5, 2e-2)
    }

    fn drain(strategy: &mut RandomSearch) -> Vec<Candidate> {
        let mut seen = Vec::new();
        while !strategy.should_stop() {
            let batch = strategy.propose();
            assert_eq!(batch.len(), 1);
            for candidate in batch {
                strategy.observe(&candidate, Observation::Completed(1.0));
                seen.push(candidate);
            }
        }
        seen
    }

    #[test]
    fn stops_after_max_trials() {
        let mut rs = RandomSearch::new(space(), 25, 1);
        let seen = drain(&mut rs);
        assert_eq!(seen.len(), 25);
        assert_eq!(rs.phase(), SearchPhase::Stopped);
        assert_eq!(rs.stop_reason(), Some(StopReason::MaxTrials));
        assert!(rs.propose().is_empty());

        let numbers: Vec<usize> = seen.iter().map(|c| c.trial_number).collect();
        assert_eq!(numbers, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn waits_for_outstanding_candidate() {
        let mut rs = RandomSearch::new(space(), 5, 1);
        let first = rs.propose();
        assert_eq!(first.len(), 1);
        assert_eq!(rs.phase(), SearchPhase::Observing);
        assert!(rs.propose().is_empty());
        rs.observe(&first[0], Observation::Failed(1e6));
        assert_eq!(rs.phase(), SearchPhase::Proposing);
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = drain(&mut RandomSearch::new(space(), 20, 42));
        let b = drain(&mut RandomSearch::new(space(), 20, 42));
        let c = drain(&mut RandomSearch::new(space(), 20, 43));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn candidates_respect_bounds() {
        let s = space();
        for candidate in drain(&mut RandomSearch::new(s.clone(), 200, 9)) {
            s.check(&candidate.params).unwrap();
        }
    }
}
