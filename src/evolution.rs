//! Generational search over strategy genomes.

use std::cmp::Ordering;
use std::thread;

use rand::Rng;

use crate::config::EvolutionConfig;
use crate::error::{AdaptError, Result};
use crate::fitness::GenomeEvaluator;
use crate::genome::{GenomeSchema, StrategyGenome};
use crate::logging::log_generation;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvolutionParams {
    pub generations: usize,
    pub population_size: usize,
    pub elite_k: usize,
    pub mutation_rate: f64,
    pub parallel: bool,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self::from(&EvolutionConfig::default())
    }
}

impl From<&EvolutionConfig> for EvolutionParams {
    fn from(cfg: &EvolutionConfig) -> Self {
        Self {
            generations: cfg.generations,
            population_size: cfg.population_size,
            elite_k: cfg.elite_k,
            mutation_rate: cfg.mutation_rate,
            parallel: cfg.parallel,
        }
    }
}

impl EvolutionParams {
    pub fn validate(&self) -> Result<()> {
        if self.generations == 0 {
            return Err(AdaptError::Configuration("generations must be > 0".into()));
        }
        if self.population_size < 2 {
            return Err(AdaptError::Configuration(format!(
                "population_size must be > 1, got {}",
                self.population_size
            )));
        }
        if self.elite_k == 0 || self.elite_k >= self.population_size {
            return Err(AdaptError::Configuration(format!(
                "elite_k must be in (0, {}), got {}",
                self.population_size, self.elite_k
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(AdaptError::Configuration(format!(
                "mutation_rate must be in [0, 1], got {}",
                self.mutation_rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionResult {
    pub best_genome: StrategyGenome,
    pub best_fitness: f64,
    /// Best fitness within each generation.
    pub best_history: Vec<f64>,
    pub avg_history: Vec<f64>,
    /// Best fitness seen so far, after each generation.
    pub best_ever_history: Vec<f64>,
}

/// Non-finite fitness sorts below every finite value.
fn rank_key(f: f64) -> f64 {
    if f.is_finite() {
        f
    } else {
        f64::NEG_INFINITY
    }
}

/// Indices sorted by descending fitness. Stable, so ties keep population order.
fn rank(fitness: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by(|&a, &b| rank_key(fitness[b]).partial_cmp(&rank_key(fitness[a])).unwrap_or(Ordering::Equal));
    order
}

fn finite_mean(xs: &[f64]) -> f64 {
    let finite: Vec<f64> = xs.iter().copied().filter(|x| x.is_finite()).collect();
    if finite.is_empty() {
        0.0
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    }
}

fn evaluation_failed(err: AdaptError) -> AdaptError {
    match err {
        AdaptError::Upgrade(_) => err,
        other => AdaptError::Upgrade(format!("genome evaluation failed: {}", other)),
    }
}

pub struct EvolutionEngine {
    params: EvolutionParams,
}

impl EvolutionEngine {
    pub fn new(params: EvolutionParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &EvolutionParams {
        &self.params
    }

    fn evaluate_all(&self, population: &[StrategyGenome], evaluator: &dyn GenomeEvaluator) -> Result<Vec<f64>> {
        if !self.params.parallel || population.len() < 2 {
            return population
                .iter()
                .map(|g| evaluator.evaluate(g).map_err(evaluation_failed))
                .collect();
        }

        let workers = num_cpus::get().clamp(1, population.len());
        let chunk = population.len().div_ceil(workers);
        let mut fitness = vec![0.0; population.len()];

        let outcomes: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = population
                .chunks(chunk)
                .zip(fitness.chunks_mut(chunk))
                .map(|(genomes, slots)| {
                    s.spawn(move || -> Result<()> {
                        for (g, slot) in genomes.iter().zip(slots.iter_mut()) {
                            *slot = evaluator.evaluate(g)?;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(AdaptError::Upgrade("evaluation worker panicked".into())))
                })
                .collect()
        });

        for outcome in outcomes {
            outcome.map_err(evaluation_failed)?;
        }
        Ok(fitness)
    }

    /// Run the full search. Parameters are re-validated before the first
    /// generation; an evaluator error aborts the run as `Upgrade`.
    pub fn run<R: Rng + ?Sized>(
        &self,
        schema: &GenomeSchema,
        evaluator: &dyn GenomeEvaluator,
        rng: &mut R,
    ) -> Result<EvolutionResult> {
        self.params.validate()?;
        let p = self.params;

        let mut population: Vec<StrategyGenome> =
            (0..p.population_size).map(|_| schema.random_genome(rng)).collect();

        let mut best: Option<(StrategyGenome, f64)> = None;
        let mut best_history = Vec::with_capacity(p.generations);
        let mut avg_history = Vec::with_capacity(p.generations);
        let mut best_ever_history = Vec::with_capacity(p.generations);

        for generation in 0..p.generations {
            let fitness = self.evaluate_all(&population, evaluator)?;
            let order = rank(&fitness);
            let top = order[0];

            let gen_best = fitness[top];
            let gen_avg = finite_mean(&fitness);
            let improved = match &best {
                None => true,
                Some((_, b)) => rank_key(gen_best) > rank_key(*b),
            };
            if improved {
                best = Some((population[top].clone(), gen_best));
            }
            let best_ever = best.as_ref().map(|(_, f)| *f).unwrap_or(gen_best);

            best_history.push(gen_best);
            avg_history.push(gen_avg);
            best_ever_history.push(best_ever);
            log_generation(generation, gen_best, gen_avg, best_ever);

            if generation + 1 == p.generations {
                break;
            }

            let elites: Vec<StrategyGenome> = order[..p.elite_k].iter().map(|&i| population[i].clone()).collect();
            let mut next = elites.clone();
            while next.len() < p.population_size {
                let parent = &elites[rng.gen_range(0..elites.len())];
                next.push(schema.mutate(parent, p.mutation_rate, rng));
            }
            population = next;
        }

        match best {
            Some((genome, fitness)) if fitness.is_finite() => Ok(EvolutionResult {
                best_genome: genome,
                best_fitness: fitness,
                best_history,
                avg_history,
                best_ever_history,
            }),
            _ => Err(AdaptError::Upgrade("no genome produced a finite fitness".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::{ENTRY_THRESHOLD, POSITION_SIZE};
    use rand::{rngs::StdRng, SeedableRng};

    /// Peaks at entry_threshold = 0.3.
    struct Peak;

    impl GenomeEvaluator for Peak {
        fn evaluate(&self, genome: &StrategyGenome) -> Result<f64> {
            let x = genome.get_or(ENTRY_THRESHOLD, 0.0);
            Ok(-(x - 0.3).powi(2) + genome.get_or(POSITION_SIZE, 0.0))
        }
    }

    struct Failing;

    impl GenomeEvaluator for Failing {
        fn evaluate(&self, _genome: &StrategyGenome) -> Result<f64> {
            Err(AdaptError::Data("no history".into()))
        }
    }

    struct NotANumber;

    impl GenomeEvaluator for NotANumber {
        fn evaluate(&self, genome: &StrategyGenome) -> Result<f64> {
            let x = genome.get_or(ENTRY_THRESHOLD, 0.0);
            Ok(if x > 0.5 { f64::NAN } else { x })
        }
    }

    fn params() -> EvolutionParams {
        EvolutionParams { generations: 8, population_size: 16, elite_k: 4, mutation_rate: 0.3, parallel: false }
    }

    #[test]
    fn validation_rejects_bad_params() {
        let bad = [
            EvolutionParams { generations: 0, ..params() },
            EvolutionParams { population_size: 1, ..params() },
            EvolutionParams { elite_k: 0, ..params() },
            EvolutionParams { elite_k: 16, ..params() },
            EvolutionParams { mutation_rate: 1.5, ..params() },
            EvolutionParams { mutation_rate: f64::NAN, ..params() },
        ];
        for p in bad {
            let err = EvolutionEngine::new(p).err().unwrap();
            assert_eq!(err.kind(), "configuration", "{:?}", p);
        }
        assert!(EvolutionParams::default().validate().is_ok());
    }

    #[test]
    fn best_ever_is_non_decreasing() {
        let engine = EvolutionEngine::new(params()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let res = engine.run(&GenomeSchema::default(), &Peak, &mut rng).unwrap();
        assert_eq!(res.best_history.len(), 8);
        assert_eq!(res.avg_history.len(), 8);
        for w in res.best_ever_history.windows(2) {
            assert!(w[1] >= w[0]);
        }
        // Elites are kept unmodified, so a deterministic evaluator never regresses.
        for w in res.best_history.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert_eq!(res.best_fitness, *res.best_ever_history.last().unwrap());
        assert!(GenomeSchema::default().contains(&res.best_genome));
    }

    #[test]
    fn same_seed_same_result() {
        let engine = EvolutionEngine::new(params()).unwrap();
        let schema = GenomeSchema::default();
        let a = engine.run(&schema, &Peak, &mut StdRng::seed_from_u64(11)).unwrap();
        let b = engine.run(&schema, &Peak, &mut StdRng::seed_from_u64(11)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parallel_matches_sequential() {
        let schema = GenomeSchema::default();
        let seq = EvolutionEngine::new(params()).unwrap();
        let par = EvolutionEngine::new(EvolutionParams { parallel: true, ..params() }).unwrap();
        let a = seq.run(&schema, &Peak, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = par.run(&schema, &Peak, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn evaluator_error_becomes_upgrade_error() {
        let engine = EvolutionEngine::new(params()).unwrap();
        let err = engine
            .run(&GenomeSchema::default(), &Failing, &mut StdRng::seed_from_u64(1))
            .unwrap_err();
        assert_eq!(err.kind(), "upgrade");

        let par = EvolutionEngine::new(EvolutionParams { parallel: true, ..params() }).unwrap();
        let err = par
            .run(&GenomeSchema::default(), &Failing, &mut StdRng::seed_from_u64(1))
            .unwrap_err();
        assert_eq!(err.kind(), "upgrade");
    }

    #[test]
    fn nan_fitness_ranks_last() {
        assert_eq!(rank(&[f64::NAN, 0.1, 0.1, -5.0]), vec![1, 2, 3, 0]);
        let engine = EvolutionEngine::new(params()).unwrap();
        let res = engine
            .run(&GenomeSchema::default(), &NotANumber, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert!(res.best_fitness.is_finite());
        assert!(res.best_genome.get_or(ENTRY_THRESHOLD, 1.0) <= 0.5);
    }
}
