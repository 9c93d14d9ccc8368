#![allow(dead_code)]

use clap::Parser;
use kd_forest_rs::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashSet;

////////////
// Consts //
////////////

pub const DEFAULT_N_DESCRIPTORS: usize = 150_000;
pub const DEFAULT_N_QUERY: usize = DEFAULT_N_DESCRIPTORS / 10;
pub const DEFAULT_N_CLUSTERS: usize = 2_000;
pub const DEFAULT_SPREAD: u8 = 12;
pub const DEFAULT_LEAF_SIZE: usize = 8;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_RATIO: f64 = 0.8;

////////////
// Parser //
////////////

/// Parsing structure
///
/// ### Fields
///
/// * `n_descriptors` - Number of indexed descriptors
/// * `n_query` - Number of query descriptors
/// * `n_clusters` - Number of clusters (and thereby images) in the data
/// * `spread` - Maximum per-dimension deviation from a cluster centre
/// * `leaf_size` - Maximum number of descriptors per leaf
/// * `seed` - Random seed for reproducibility
/// * `ratio` - Lowe ratio threshold for the match statistics
#[derive(Parser)]
pub struct Cli {
    #[arg(long, default_value_t = DEFAULT_N_DESCRIPTORS)]
    pub n_descriptors: usize,

    #[arg(long, default_value_t = DEFAULT_N_QUERY)]
    pub n_query: usize,

    #[arg(long, default_value_t = DEFAULT_N_CLUSTERS)]
    pub n_clusters: usize,

    #[arg(long, default_value_t = DEFAULT_SPREAD)]
    pub spread: u8,

    #[arg(long, default_value_t = DEFAULT_LEAF_SIZE)]
    pub leaf_size: usize,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    #[arg(long, default_value_t = DEFAULT_RATIO)]
    pub ratio: f64,
}

//////////
// Data //
//////////

/// Draw queries from the indexed descriptors and perturb them
///
/// Simulates the same feature re-detected in another view.
///
/// ### Params
///
/// * `descriptors` - Indexed descriptors
/// * `n_samples` - Number of queries to draw
/// * `noise` - Maximum per-dimension perturbation
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// The perturbed query descriptors
pub fn subsample_with_noise(
    descriptors: &[U8Descriptor],
    n_samples: usize,
    noise: u8,
    seed: u64,
) -> Vec<U8Descriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = noise as i16;

    (0..n_samples)
        .map(|_| {
            let source = &descriptors[rng.random_range(0..descriptors.len())];
            let mut query = *source;
            for v in query.features.iter_mut() {
                let delta: i16 = rng.random_range(-noise..=noise);
                *v = (*v as i16 + delta).clamp(0, 255) as u8;
            }
            query
        })
        .collect()
}

////////////////
// Structures //
////////////////

/// BenchmarkResult
///
/// ### Fields
///
/// * `method` - Name of the method
/// * `build_time_ms` - The build time of the index in ms
/// * `query_time_ms` - The query time of the index in ms
/// * `total_time_ms` - Total time the index build & query takes in ms
/// * `recall_at_1` - Recall of the best neighbour against ground truth
/// * `recall_at_2` - Recall of both neighbours against ground truth
/// * `ratio_pass` - Fraction of queries passing the ratio test
/// * `index_size_mb` - Index size in MB
pub struct BenchmarkResult {
    pub method: String,
    pub build_time_ms: f64,
    pub query_time_ms: f64,
    pub total_time_ms: f64,
    pub recall_at_1: f64,
    pub recall_at_2: f64,
    pub ratio_pass: f64,
    pub index_size_mb: f64,
}

/////////////
// Helpers //
/////////////

/// Calculate Recall@1 and Recall@2
///
/// ### Params
///
/// * `truth` - Exhaustive matches
/// * `approx` - Matches of the approximate index
///
/// ### Returns
///
/// `(recall@1, recall@2)`
pub fn calculate_recall(truth: &[Query2NnMatch], approx: &[Query2NnMatch]) -> (f64, f64) {
    let mut hits_1 = 0;
    let mut hits_2 = 0;
    let mut total_2 = 0;

    for (t, a) in truth.iter().zip(approx.iter()) {
        if let (Some(tb), Some(ab)) = (t.best, a.best) {
            if tb.association.global_index == ab.association.global_index {
                hits_1 += 1;
            }
        }

        let approx_set: FxHashSet<u32> = [a.best, a.second]
            .iter()
            .flatten()
            .map(|nb| nb.association.global_index)
            .collect();
        for nb in [t.best, t.second].iter().flatten() {
            total_2 += 1;
            if approx_set.contains(&nb.association.global_index) {
                hits_2 += 1;
            }
        }
    }

    let recall_1 = hits_1 as f64 / truth.len().max(1) as f64;
    let recall_2 = hits_2 as f64 / total_2.max(1) as f64;
    (recall_1, recall_2)
}

/// Fraction of matches passing the ratio test
pub fn ratio_pass_rate(matches: &[Query2NnMatch], ratio: f64) -> f64 {
    let passed = matches
        .iter()
        .filter(|m| m.passes_ratio_test(ratio))
        .count();
    passed as f64 / matches.len().max(1) as f64
}

/// Helper to print results to console
///
/// ### Params
///
/// * `config` - Benchmark configuration
/// * `results` - Benchmark results to print
pub fn print_results(config: &str, results: &[BenchmarkResult]) {
    println!("\n{:=>123}", "");
    println!("Benchmark: {}", config);
    println!("{:=>123}", "");
    println!(
        "{:<45} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
        "Method", "Build (ms)", "Query (ms)", "Total (ms)", "Recall@1", "Recall@2", "Size (MB)"
    );
    println!("{:->123}", "");
    for result in results {
        println!(
            "{:<45} {:>12.2} {:>12.2} {:>12.2} {:>12.4} {:>12.4} {:>12.2}",
            result.method,
            result.build_time_ms,
            result.query_time_ms,
            result.total_time_ms,
            result.recall_at_1,
            result.recall_at_2,
            result.index_size_mb
        );
    }
    println!("{:->123}", "");
    for result in results {
        println!(
            "{:<45} ratio test pass rate: {:.4}",
            result.method, result.ratio_pass
        );
    }
    println!();
}
