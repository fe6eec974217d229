fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "semiscore_core=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use semiscore_core::codebook::{CodebookSet, GaussianFile};
    use semiscore_core::logmath::{LogMath, SENSCR_SHIFT};
    use semiscore_core::mixw::MixtureWeights;
    use semiscore_core::{
        load_config, DiagnosticsSnapshot, Hmm, ScorerConfig, ScoringSession, SemiContModel,
        SenoneScorer, SenoneSequences,
    };
    use serde::Serialize;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        config: Option<PathBuf>,
        frames: usize,
        iterations: usize,
        seed: u64,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct ModeSummary {
        mode: String,
        runs: usize,
        frames: usize,
        p50_frame_us: f64,
        p95_frame_us: f64,
        avg_frame_us: f64,
        avg_senones_scored: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        model: String,
        n_feat: usize,
        n_density: usize,
        n_senones: usize,
        topn: usize,
        strategy: String,
        iterations: usize,
        frames: usize,
        seed: u64,
        modes: Vec<ModeSummary>,
        diagnostics: DiagnosticsSnapshot,
    }

    fn parse_args() -> Result<Args, String> {
        let mut config: Option<PathBuf> = None;
        let mut frames: usize = 500;
        let mut iterations: usize = 3;
        let mut seed: u64 = 7;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --config".into());
                    };
                    config = Some(PathBuf::from(v));
                }
                "--frames" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --frames".into());
                    };
                    frames = v
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --frames".to_string())?
                        .max(1);
                }
                "--iterations" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --iterations".into());
                    };
                    iterations = v
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .clamp(1, 10);
                }
                "--seed" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --seed".into());
                    };
                    seed = v
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seed".to_string())?;
                }
                "--output" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --output".into());
                    };
                    output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p semiscore-core --release --bin benchmark -- \\
  [--config <scorer.json>] [--frames <n>] [--iterations <n>] [--seed <n>] [--output <file.json>]

Without --config a synthetic 4-stream model is scored."
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }

        Ok(Args {
            config,
            frames,
            iterations,
            seed,
            output,
        })
    }

    /// Random codebooks and dense weights shaped like a small Sphinx-2
    /// semi-continuous model.
    fn synthetic_model(rng: &mut StdRng) -> Result<SemiContModel, String> {
        let veclen = vec![12, 24, 3, 12];
        let (n_density, n_sen) = (256, 2000);
        let gaussians = |rng: &mut StdRng, lo: f32, hi: f32| GaussianFile {
            n_density,
            veclen: veclen.clone(),
            streams: veclen
                .iter()
                .map(|&len| (0..n_density * len).map(|_| rng.gen_range(lo..hi)).collect())
                .collect(),
        };
        let means = gaussians(rng, -2.0, 2.0);
        let vars = gaussians(rng, 0.2, 1.5);

        let config = ScorerConfig::default();
        let lmath = LogMath::new(config.log_base, 0, false).map_err(|e| e.to_string())?;
        let lmath_8b =
            LogMath::new(config.log_base, SENSCR_SHIFT, true).map_err(|e| e.to_string())?;
        let codebooks =
            CodebookSet::from_files(&means, &vars, config.var_floor, &lmath).map_err(|e| e.to_string())?;
        let weights = (0..veclen.len() * n_density * n_sen)
            .map(|_| rng.gen_range(0..=159u8))
            .collect();
        let mixw = MixtureWeights::dense(veclen.len(), n_density, n_sen, weights)
            .map_err(|e| e.to_string())?;
        SemiContModel::from_parts(&config, lmath_8b, codebooks, mixw, None).map_err(|e| e.to_string())
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        if sorted.len() == 1 {
            return sorted[0];
        }
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    let args = parse_args()?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let (model, label) = match &args.config {
        Some(path) => {
            let mut config = load_config(path);
            config.apply_env_overrides();
            let model = SemiContModel::load(&config).map_err(|e| e.to_string())?;
            (model, path.display().to_string())
        }
        None => (Arc::new(synthetic_model(&mut rng)?), "synthetic".to_string()),
    };

    let n_feat = model.n_feat();
    let n_sen = model.n_senones();
    // Three-state sequences covering every senone, for the active mode.
    let sseq = SenoneSequences::new(
        3,
        (0..n_sen.div_ceil(3) * 3).map(|s| (s % n_sen) as u32).collect(),
    )
    .map_err(|e| e.to_string())?;
    model.check_sequences(&sseq).map_err(|e| e.to_string())?;
    let n_ssid = sseq.n_ssid() as u32;
    let veclens: Vec<usize> = (0..n_feat).map(|f| model.codebooks().veclen(f)).collect();
    let frames: Vec<Vec<Vec<f32>>> = (0..args.frames)
        .map(|_| {
            veclens
                .iter()
                .map(|&len| (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect())
                .collect()
        })
        .collect();

    println!(
        "Scoring {} frames x {} iterations (streams={n_feat}, senones={n_sen}, topn={}, {:?})",
        args.frames,
        args.iterations,
        model.topn(),
        model.strategy()
    );

    let mut session = ScoringSession::new(Arc::clone(&model));
    let mut scores = vec![0i16; n_sen];
    let mut modes = Vec::new();
    for (mode, compute_all) in [("all", true), ("active", false)] {
        let mut latencies = Vec::with_capacity(args.frames * args.iterations);
        let mut scored = 0usize;
        for _ in 0..args.iterations {
            session.reset();
            for (t, feats) in frames.iter().enumerate() {
                let feats: Vec<&[f32]> = feats.iter().map(Vec::as_slice).collect();
                if !compute_all {
                    session.clear_active();
                    for _ in 0..n_ssid / 4 {
                        let hmm = Hmm::new(3, rng.gen_range(0..n_ssid));
                        session.mark_hmm_active(&hmm, &sseq);
                    }
                    scored += session.build_active_list();
                } else {
                    scored += n_sen;
                }
                let started = Instant::now();
                let _best = session.frame_eval(&feats, t as u32, compute_all, &mut scores);
                latencies.push(started.elapsed().as_secs_f64() * 1e6);
            }
        }
        let runs = latencies.len();
        let summary = ModeSummary {
            mode: mode.into(),
            runs: args.iterations,
            frames: runs,
            p50_frame_us: percentile(&latencies, 0.50),
            p95_frame_us: percentile(&latencies, 0.95),
            avg_frame_us: if runs == 0 {
                0.0
            } else {
                latencies.iter().sum::<f64>() / runs as f64
            },
            avg_senones_scored: if runs == 0 {
                0.0
            } else {
                scored as f64 / runs as f64
            },
        };
        println!(
            "{mode}: p50={:.1}us p95={:.1}us avg_senones={:.0}",
            summary.p50_frame_us, summary.p95_frame_us, summary.avg_senones_scored
        );
        modes.push(summary);
    }

    let summary = Summary {
        model: label,
        n_feat,
        n_density: model.n_density(),
        n_senones: n_sen,
        topn: model.topn(),
        strategy: format!("{:?}", model.strategy()),
        iterations: args.iterations,
        frames: args.frames,
        seed: args.seed,
        modes,
        diagnostics: session.diagnostics().snapshot(),
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
