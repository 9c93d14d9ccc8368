mod commons;
use clap::Parser;
use commons::*;
use kd_forest_rs::dist::verify_l2_distance_simd;
use kd_forest_rs::exhaustive::exhaustive_query_2nn;
use kd_forest_rs::synthetic::generate_clustered_descriptors;
use kd_forest_rs::*;
use std::time::Instant;
use thousands::*;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = verify_l2_distance_simd(10_000, cli.seed) {
        eprintln!("Distance kernel self-test failed: {}", e);
        std::process::exit(1);
    }

    println!("-----------------------------");
    println!(
        "Generating synthetic descriptors: {} descriptors, {} clusters, spread {}.",
        cli.n_descriptors.separate_with_underscores(),
        cli.n_clusters,
        cli.spread
    );
    println!("-----------------------------");

    let (descriptors, image_indexes) =
        generate_clustered_descriptors(cli.n_descriptors, cli.n_clusters, cli.spread, cli.seed);
    let queries = subsample_with_noise(&descriptors, cli.n_query, cli.spread / 2, cli.seed + 1);
    let mut results = Vec::new();

    // Exhaustive ground truth
    println!("Querying exhaustively...");
    let start = Instant::now();
    let truth = exhaustive_query_2nn(&descriptors, &queries);
    let query_time = start.elapsed().as_secs_f64() * 1000.0;

    results.push(BenchmarkResult {
        method: "Exhaustive".to_string(),
        build_time_ms: 0.0,
        query_time_ms: query_time,
        total_time_ms: query_time,
        recall_at_1: 1.0,
        recall_at_2: 1.0,
        ratio_pass: ratio_pass_rate(&truth, cli.ratio),
        index_size_mb: 0.0,
    });

    println!("-----------------------------");

    let tree_counts = [1, 2, 4, 8, 16];
    let budgets = [50, 100, 200, 500, 1_000];

    for tree_count in tree_counts {
        println!("Building KD forest with {} trees...", tree_count);
        let start = Instant::now();
        let forest = match build_kd_forest(
            &descriptors,
            &image_indexes,
            tree_count,
            cli.leaf_size,
            cli.seed,
            false,
        ) {
            Ok(forest) => forest,
            Err(e) => {
                eprintln!("Failed to build forest: {}", e);
                std::process::exit(1);
            }
        };
        let build_time = start.elapsed().as_secs_f64() * 1000.0;
        let index_size_mb = forest.memory_usage_bytes() as f64 / (1024.0 * 1024.0);

        for budget in budgets {
            println!(
                "Querying KD forest ({} trees) with budget {}...",
                tree_count, budget
            );
            let start = Instant::now();
            let approx = query_kd_forest_2nn(&forest, &queries, budget, false);
            let query_time = start.elapsed().as_secs_f64() * 1000.0;

            let (recall_at_1, recall_at_2) = calculate_recall(&truth, &approx);

            results.push(BenchmarkResult {
                method: format!("KdForest-nt:{}:c:{}", tree_count, budget),
                build_time_ms: build_time,
                query_time_ms: query_time,
                total_time_ms: build_time + query_time,
                recall_at_1,
                recall_at_2,
                ratio_pass: ratio_pass_rate(&approx, cli.ratio),
                index_size_mb,
            });
        }
    }

    print_results(
        &format!(
            "{}k descriptors, {}k queries, leaf size {}",
            cli.n_descriptors / 1000,
            cli.n_query / 1000,
            cli.leaf_size
        ),
        &results,
    );
}
