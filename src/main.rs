use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sortrs::config::Settings;
use sortrs::core::classifier::{classify, Classification};
use sortrs::core::features::FeatureExtractor;
use sortrs::core::grouping::GroupingMode;
use sortrs::core::image::{aspect_ratio, decode};
use sortrs::core::ocr::TesseractCli;
use sortrs::services::context::{Progress, RunContext};
use sortrs::services::executor::{execute_plan, ExecutionResult};
use sortrs::services::grouper::{build_grouping_plan, execute_grouping_plan};
use sortrs::services::history::{read_events, EventSink, JsonlEventLog, NullEventSink};
use sortrs::services::planner::{build_plan, Plan, Reference};
use sortrs::services::store::{LocalStore, ObjectStore, RetryingStore};

#[derive(Parser, Debug)]
#[command(name = "sortrs", version, about = "Sort stored images into folders by similarity or content")]
struct Cli {
    /// Configuration file (default: ./sortrs.toml if present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory backing the object store
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Bucket to operate on
    #[arg(long, global = true, value_name = "NAME")]
    bucket: Option<String>,

    /// Concurrent workers (1-32)
    #[arg(long, global = true, value_name = "N")]
    workers: Option<usize>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare a folder against a reference and write a move plan
    Preview {
        /// Folder to scan (direct members only; empty for the bucket root)
        #[arg(short, long, default_value = "")]
        folder: String,
        /// Reference image: local file, object key or URL
        #[arg(short, long)]
        reference: String,
        /// Where to write the plan
        #[arg(long, value_name = "FILE", default_value = "plan.json")]
        out: PathBuf,
    },

    /// Carry out a previously written plan
    Execute {
        #[arg(long, value_name = "FILE")]
        plan: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Where to write the result
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },

    /// Preview and execute in one go
    Sort {
        #[arg(short, long, default_value = "")]
        folder: String,
        #[arg(short, long)]
        reference: String,
        #[arg(short, long)]
        yes: bool,
        /// Only show what would be moved
        #[arg(long)]
        dry_run: bool,
    },

    /// Move images into folders named after their classification
    Group {
        #[arg(short, long, default_value = "")]
        folder: String,
        /// Output prefix (default: the scanned folder)
        #[arg(short, long)]
        output: Option<String>,
        /// category, subcategory or tag
        #[arg(short, long, default_value = "category")]
        mode: GroupingMode,
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the fingerprint and classification of a local image
    Classify {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Work with the session log
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all recorded sessions
    List {
        /// Session log (default: from configuration)
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = cli.root {
        settings.store_root = root;
    }
    if let Some(bucket) = cli.bucket {
        settings.bucket = bucket;
    }
    if let Some(workers) = cli.workers {
        settings.workers = workers;
    }

    match cli.command {
        Commands::Preview {
            folder,
            reference,
            out,
        } => {
            let (ctx, bar) = run_context(&settings)?;
            let reference = resolve_reference(&ctx, &settings.bucket, &reference)?;
            let plan = benchmark("preview", || build_plan(&ctx, &settings.bucket, &folder, &reference))?;
            bar.finish_and_clear();

            print_plan(&plan);
            fs::write(&out, plan.to_json()?)
                .with_context(|| format!("Failed to write plan {:?}", out))?;
            println!("\n📝 Plan written to {}", out.display());
        }

        Commands::Execute { plan, yes, out } => {
            let json = fs::read_to_string(&plan)
                .with_context(|| format!("Could not read plan {:?}", plan))?;
            let plan = Plan::from_json(&json).with_context(|| format!("Invalid plan {:?}", plan))?;
            plan.validate().context("Plan failed validation")?;
            print_plan(&plan);

            if !confirm(&format!("Move {} images to {}?", plan.to_move_count, plan.dest_folder), yes)? {
                println!("Aborted; nothing was changed.");
                return Ok(());
            }

            let (ctx, bar) = run_context(&settings)?;
            let sink = event_sink(&settings);
            let result = benchmark("execute", || execute_plan(&ctx, &plan, sink.as_ref()))?;
            bar.finish_and_clear();

            print_result(&result);
            if let Some(out) = out {
                fs::write(&out, result.to_json()?)
                    .with_context(|| format!("Failed to write result {:?}", out))?;
                println!("📝 Result written to {}", out.display());
            }
        }

        Commands::Sort {
            folder,
            reference,
            yes,
            dry_run,
        } => {
            let (ctx, bar) = run_context(&settings)?;
            let reference = resolve_reference(&ctx, &settings.bucket, &reference)?;
            let plan = build_plan(&ctx, &settings.bucket, &folder, &reference)?;
            bar.finish_and_clear();
            print_plan(&plan);

            if dry_run {
                println!("\n⚠️  Dry-run only; no files were changed.");
                return Ok(());
            }
            if plan.to_move.is_empty() {
                println!("Nothing to move.");
                return Ok(());
            }
            if !confirm(&format!("Move {} images to {}?", plan.to_move_count, plan.dest_folder), yes)? {
                println!("Aborted; nothing was changed.");
                return Ok(());
            }

            bar.reset();
            let sink = event_sink(&settings);
            let result = execute_plan(&ctx, &plan, sink.as_ref())?;
            bar.finish_and_clear();
            print_result(&result);
        }

        Commands::Group {
            folder,
            output,
            mode,
            dry_run,
            yes,
        } => {
            let (ctx, bar) = run_context(&settings)?;
            let plan = build_grouping_plan(&ctx, &settings.bucket, &folder, output.as_deref(), mode)?;
            bar.finish_and_clear();

            println!(
                "▶ {} images in {:?} by {}",
                plan.total_scanned, plan.folder, plan.mode
            );
            for (group, count) in plan.group_counts() {
                println!("   📁 {}{}/ ← {} image(s)", plan.output_prefix, group, count);
            }
            for item in &plan.unreadable {
                println!("   ⚠️  {} stays ({})", item.filename, item.error);
            }

            if dry_run {
                println!("\n⚠️  Dry-run only; no files were changed.");
                return Ok(());
            }
            if !confirm(&format!("Move {} images?", plan.assignments.len()), yes)? {
                println!("Aborted; nothing was changed.");
                return Ok(());
            }

            bar.reset();
            let sink = event_sink(&settings);
            let result = execute_grouping_plan(&ctx, &plan, sink.as_ref())?;
            bar.finish_and_clear();

            println!(
                "\n✅ Moved {}, unchanged {}, failed {}",
                result.moved_count, result.unchanged_count, result.failed_count
            );
            for failure in &result.failures {
                eprintln!("   ❌ {} ({}): {}", failure.filename, failure.stage, failure.error);
            }
        }

        Commands::Classify { path } => {
            let bytes = fs::read(&path).with_context(|| format!("Failed to open {:?}", path))?;
            let extractor = extractor(&settings);
            match decode(&bytes) {
                Ok(img) => {
                    let fingerprint = extractor.fingerprint(&img, extractor.has_recognizer());
                    let classification = classify(&fingerprint, aspect_ratio(&img));
                    let signals = extractor.placeholder_signals(&img, fingerprint.edge_score);
                    println!("{}", serde_json::to_string_pretty(&fingerprint)?);
                    println!("placeholder signals: {:?}", signals);
                    print_classification(&classification);
                }
                Err(e) => print_classification(&Classification::unclassified(e.to_string())),
            }
        }

        Commands::History { command } => match command {
            HistoryCmd::List { log } => {
                let path = log
                    .or(settings.event_log)
                    .context("No session log configured")?;
                let events = read_events(&path)
                    .with_context(|| format!("Could not open session log {:?}", path))?;

                println!("🗂️  Session History:");
                for (i, event) in events.iter().enumerate() {
                    println!(
                        "[{}] {} {} {}\n     {} → {}\n     moved: {}  unchanged: {}  failed: {}\n",
                        i,
                        event.date,
                        event.time,
                        event.event_type,
                        if event.source_prefix.is_empty() { "(root)" } else { event.source_prefix.as_str() },
                        event.output_prefix,
                        event.results.moved_count,
                        event.results.unchanged_count,
                        event.extra.failed
                    );
                }
            }
        },
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn extractor(settings: &Settings) -> FeatureExtractor {
    if settings.ocr.enabled {
        FeatureExtractor::new().with_recognizer(Arc::new(TesseractCli::new(&settings.ocr.program)))
    } else {
        FeatureExtractor::new()
    }
}

/// Store, worker pool, progress bar and Ctrl-C handling for one command.
fn run_context(settings: &Settings) -> Result<(RunContext, ProgressBar)> {
    let store: Arc<dyn ObjectStore> = Arc::new(RetryingStore::new(
        LocalStore::new(&settings.store_root),
        settings.retry_policy(),
    ));

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:30}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    let progress_bar = bar.clone();

    let ctx = RunContext::new(store)?
        .with_workers(settings.workers())?
        .with_extractor(extractor(settings))
        .with_thresholds(settings.thresholds)
        .with_verify_uploads(settings.verify_uploads)
        .with_progress(Box::new(move |p: Progress| {
            progress_bar.set_length(p.total as u64);
            progress_bar.set_position(p.completed as u64);
            progress_bar.set_message(format!("{:?} {}", p.phase, p.current));
        }));

    let token = ctx.cancellation_token();
    ctrlc::set_handler(move || {
        token.store(true, std::sync::atomic::Ordering::Relaxed);
        eprintln!("\n⏹  Cancelling; in-flight items will finish first…");
    })
    .context("Failed to install Ctrl-C handler")?;

    Ok((ctx, bar))
}

fn event_sink(settings: &Settings) -> Box<dyn EventSink> {
    match &settings.event_log {
        Some(path) => Box::new(JsonlEventLog::new(path)),
        None => Box::new(NullEventSink),
    }
}

/// A local file wins over a key of the same name.
fn resolve_reference(ctx: &RunContext, bucket: &str, input: &str) -> Result<Reference> {
    let path = Path::new(input);
    if path.is_file() {
        let bytes = fs::read(path).with_context(|| format!("Failed to read reference {:?}", path))?;
        return Ok(Reference::from_bytes(bytes, input));
    }
    Reference::from_store(ctx.store.as_ref(), bucket, input)
        .with_context(|| format!("Failed to fetch reference {:?} from bucket {:?}", input, bucket))
}

fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

fn print_plan(plan: &Plan) {
    println!(
        "▶ Reference: {} ({})",
        plan.reference_class,
        if plan.reference_is_placeholder() { "placeholder" } else { "real" }
    );
    println!(
        "▶ Scanned {} images in {}",
        plan.total_scanned,
        if plan.folder.is_empty() { "(root)" } else { plan.folder.as_str() }
    );
    println!("\n📦 {} to move → {}", plan.to_move_count, plan.dest_folder);
    for record in &plan.to_move {
        println!(
            "   {}  (hash dist: {} | pixel sim: {:.2} | {})",
            record.filename,
            record.hash_distance,
            record.pixel_similarity,
            record.reason.map(|r| r.as_str()).unwrap_or("")
        );
    }
    println!("\n➡️  {} stay", plan.to_stay_count);
    for record in &plan.to_stay {
        match &record.error {
            Some(error) => println!("   {}  ⚠️  {}", record.filename, error),
            None => println!(
                "   {}  (hash dist: {} | pixel sim: {:.2})",
                record.filename, record.hash_distance, record.pixel_similarity
            ),
        }
    }
}

fn print_result(result: &ExecutionResult) {
    for file in &result.moved_files {
        println!("   ✅ MOVED {} → {}", file.filename, file.dest_key);
    }
    for failure in &result.failures {
        eprintln!("   ❌ {} ({}): {}", failure.filename, failure.stage, failure.error);
    }
    println!(
        "\n✅ Moved {}, unchanged {}, failed {} of {} scanned{}",
        result.moved_count,
        result.unchanged_count,
        result.failed_count,
        result.total_scanned,
        if result.cancelled { " (cancelled)" } else { "" }
    );
}

fn print_classification(c: &Classification) {
    println!("category:    {}", c.category);
    println!("subcategory: {}", c.subcategory);
    println!("tags:        {}", c.tags.join(", "));
    println!("description: {}", c.description);
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
