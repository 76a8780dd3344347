//! buildorc — entry point
//!
//! Machine-readable subcommands print exactly one JSON envelope to
//! stdout; `tracing` logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use buildorc::cachedir::CacheNotFound;
use buildorc::jobstore::{JobNotFound, UnknownCiStage};
use buildorc::schema::{Cache, ErrorResponse, ExpiryCandidatesData, GcData, JobsData, PublicJob, Response};
use buildorc::validate::ValidationFailed;

/// Marker error: a `--pools` CLI argument isn't a valid `NAME:DEPTH` spec.
#[derive(Debug)]
struct PoolSpecInvalid(String);

impl std::fmt::Display for PoolSpecInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid pool spec: {}", self.0)
    }
}
impl std::error::Error for PoolSpecInvalid {}

#[derive(Debug, Parser)]
#[command(name = "buildorc")]
#[command(about = "CI build orchestrator: DAG scheduler, process supervisor, live run report", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new cache directory and declare the run's stages/pools.
    Init {
        #[arg(long = "project-name")]
        project_name: String,
        #[arg(long = "stages", value_name = "STAGE")]
        stages: Vec<String>,
        /// `NAME:DEPTH` pairs, e.g. `--pools compile:4`.
        #[arg(long = "pools", value_name = "NAME:DEPTH")]
        pools: Vec<String>,
        #[arg(long = "output-directory", conflicts_with = "output_prefix")]
        output_directory: Option<PathBuf>,
        #[arg(long = "output-prefix", conflicts_with = "output_directory")]
        output_prefix: Option<PathBuf>,
        #[arg(long = "output-symlink")]
        output_symlink: Option<PathBuf>,
        #[arg(long = "no-print-out-dir")]
        no_print_out_dir: bool,
    },

    /// Declare one job.
    AddJob {
        #[arg(long)]
        command: String,
        #[arg(long = "pipeline-name")]
        pipeline_name: String,
        #[arg(long = "ci-stage")]
        ci_stage: String,
        #[arg(long = "inputs", value_name = "FILE")]
        inputs: Vec<String>,
        #[arg(long = "outputs", value_name = "FILE")]
        outputs: Vec<String>,
        /// Omitted entirely: a missing declared output still warns. Passed
        /// with no values: every declared output is phony. Passed with
        /// values: only those named outputs are phony.
        #[arg(long = "phony-outputs", value_name = "FILE", num_args = 0..)]
        phony_outputs: Option<Vec<String>>,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long = "timeout-ok")]
        timeout_ok: bool,
        #[arg(long = "timeout-ignore")]
        timeout_ignore: bool,
        #[arg(long = "ignore-returns", value_name = "RC")]
        ignore_returns: Vec<i32>,
        #[arg(long = "ok-returns", value_name = "RC")]
        ok_returns: Vec<i32>,
        #[arg(long = "outcome-table")]
        outcome_table: Option<String>,
        #[arg(long = "interleave-stdout-stderr")]
        interleave_stdout_stderr: bool,
        #[arg(long = "stdout-file")]
        stdout_file: Option<String>,
        #[arg(long = "stderr-file")]
        stderr_file: Option<String>,
        #[arg(long)]
        pool: Option<String>,
        #[arg(long = "tags", value_name = "TAG")]
        tags: Vec<String>,
        #[arg(long)]
        description: Option<String>,
        /// Accepted for compatibility; memory profiling is out of core scope.
        #[arg(long = "profile-memory")]
        profile_memory: bool,
        #[arg(long = "profile-memory-interval")]
        profile_memory_interval: Option<u64>,
    },

    /// Print every declared job, private fields stripped.
    GetJobs,

    /// Read a replacement job array from stdin and apply the diff.
    TransformJobs,

    /// Schedule and run every declared job (or a pipeline/stage subset).
    RunBuild {
        /// Dry run: mark every job successful without spawning anything.
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
        /// Logical CPU count if omitted; an explicit `0` means unbounded.
        #[arg(short = 'j', long = "parallel")]
        parallel: Option<usize>,
        #[arg(short = 'o', long = "out-file")]
        out_file: Option<PathBuf>,
        #[arg(long = "fail-on-pipeline-failure")]
        fail_on_pipeline_failure: bool,
        #[arg(short = 'p', long = "pipelines", value_name = "NAME")]
        pipelines: Vec<String>,
        #[arg(short = 's', long = "stage")]
        stage: Option<String>,
    },

    /// [Internal] Run a single already-declared job by id.
    Exec {
        #[arg(long = "job-id")]
        job_id: String,
    },

    /// Request an on-demand run snapshot from a running build.
    DumpRun {
        #[arg(long)]
        retries: Option<u32>,
    },

    /// List `report_data/` run directories currently marked expired.
    PrintExpiryCandidates,

    /// Remove expired `report_data/` run directories.
    Gc,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = dispatch_error(&e);
            std::process::exit(code);
        }
    }
}

/// Map a known marker error to its JSON error code and print it; unknown
/// errors collapse to `internal_error`. Always returns exit code 1 (the
/// only non-1 exit code, 10, is returned directly by `run` for
/// `--fail-on-pipeline-failure`).
fn dispatch_error(e: &anyhow::Error) -> i32 {
    let (code, retryable) = if e.downcast_ref::<CacheNotFound>().is_some() {
        ("cache_not_found", false)
    } else if e.downcast_ref::<UnknownCiStage>().is_some() {
        ("unknown_ci_stage", false)
    } else if e.downcast_ref::<JobNotFound>().is_some() {
        ("job_not_found", false)
    } else if e.downcast_ref::<ValidationFailed>().is_some() {
        ("validation_failed", false)
    } else if e.downcast_ref::<PoolSpecInvalid>().is_some() {
        ("pool_spec_invalid", false)
    } else {
        ("internal_error", false)
    };
    ErrorResponse::new(code, format!("{e:#}"), retryable).print();
    1
}

fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let config = buildorc::config::load(&cwd)?;

    match cli.command {
        Command::Init {
            project_name,
            stages,
            pools,
            output_directory,
            output_prefix,
            output_symlink,
            no_print_out_dir,
        } => {
            let stages = config.resolve_stages(if stages.is_empty() { None } else { Some(stages) });
            let pools = config.resolve_pools(parse_pools(&pools)?);
            let dir = output_directory
                .or_else(|| output_prefix.map(|p| p.join("buildorc-cache")))
                .unwrap_or_else(|| cwd.join("buildorc-cache"));

            let cache = buildorc::cachedir::init(&dir, &project_name, stages, pools, output_symlink.as_deref())?;
            if !no_print_out_dir {
                Response::new("init", serde_json::json!({ "cache_dir": dir, "run_id": cache.run_id })).print();
            }
        }

        Command::AddJob {
            command,
            pipeline_name,
            ci_stage,
            inputs,
            outputs,
            phony_outputs,
            cwd: job_cwd,
            timeout,
            timeout_ok,
            timeout_ignore,
            ignore_returns,
            ok_returns,
            outcome_table,
            interleave_stdout_stderr,
            stdout_file,
            stderr_file,
            pool,
            tags,
            description,
            profile_memory: _,
            profile_memory_interval: _,
        } => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let cache = buildorc::cachedir::read_cache(&cache_dir)?;
            let job = buildorc::jobstore::add_job(
                &cache_dir,
                &cache.stages,
                buildorc::jobstore::NewJob {
                    pipeline_name,
                    ci_stage,
                    description,
                    command,
                    cwd: job_cwd,
                    inputs,
                    outputs,
                    phony_outputs,
                    timeout,
                    timeout_ok,
                    timeout_ignore,
                    ignore_returns,
                    ok_returns,
                    outcome_table,
                    interleave_stdout_stderr,
                    stdout_file,
                    stderr_file,
                    pool,
                    tags,
                },
            )?;
            Response::new("add-job", PublicJob::from(&job)).print();
        }

        Command::GetJobs => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let jobs = buildorc::jobstore::get_jobs(&cache_dir)?;
            Response::new("get-jobs", JobsData { jobs }).print();
        }

        Command::TransformJobs => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let cache = buildorc::cachedir::read_cache(&cache_dir)?;
            let mut stdin_raw = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut stdin_raw)?;
            let new_jobs: Vec<PublicJob> = serde_json::from_str(&stdin_raw)?;
            let jobs = buildorc::jobstore::transform_jobs(&cache_dir, &cache.stages, &new_jobs)?;
            Response::new(
                "transform-jobs",
                JobsData { jobs: jobs.iter().map(PublicJob::from).collect() },
            )
            .print();
        }

        Command::RunBuild {
            dry_run,
            parallel,
            out_file,
            fail_on_pipeline_failure,
            pipelines,
            stage,
        } => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let exit_code = run_build(
                &cache_dir,
                &config,
                dry_run,
                parallel,
                out_file,
                fail_on_pipeline_failure,
                pipelines,
                stage,
            )?;
            return Ok(exit_code);
        }

        Command::Exec { job_id } => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let job = buildorc::jobstore::get_job(&cache_dir, &job_id)?;
            let outcome = buildorc::scheduler::execute_job(&cache_dir, &job)?;
            return Ok(if outcome == buildorc::schema::Outcome::Success { 0 } else { 1 });
        }

        Command::DumpRun { retries } => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let doc = buildorc::signals::request_dump(&cache_dir, retries, 0.1)?;
            println!("{}", serde_json::to_string(&doc)?);
        }

        Command::PrintExpiryCandidates => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let candidates =
                buildorc::expiry::print_expiry_candidates(&buildorc::cachedir::report_data_dir(&cache_dir))?;
            Response::new("print-expiry-candidates", ExpiryCandidatesData { candidates }).print();
        }

        Command::Gc => {
            let cache_dir = buildorc::cachedir::find_cache_dir(&cwd)?;
            let removed = buildorc::expiry::gc(&buildorc::cachedir::report_data_dir(&cache_dir))?;
            Response::new("gc", GcData { removed }).print();
        }
    }
    Ok(0)
}

fn parse_pools(raw: &[String]) -> Result<buildorc::schema::Pools> {
    let mut pools = buildorc::schema::Pools::new();
    for spec in raw {
        let (name, depth) = spec
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!(PoolSpecInvalid(format!("{spec:?}, expected NAME:DEPTH"))))?;
        let depth: u32 = depth
            .parse()
            .map_err(|_| anyhow::anyhow!(PoolSpecInvalid(format!("non-integer depth in {spec:?}"))))?;
        if depth < 1 {
            anyhow::bail!(PoolSpecInvalid(format!("pool {name:?} depth must be >= 1, got {depth}")));
        }
        pools.insert(name.to_string(), depth);
    }
    Ok(pools)
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    cache_dir: &std::path::Path,
    config: &buildorc::config::Config,
    dry_run: bool,
    parallel_flag: Option<usize>,
    out_file: Option<PathBuf>,
    fail_on_pipeline_failure: bool,
    pipelines: Vec<String>,
    stage: Option<String>,
) -> Result<i32> {
    buildorc::signals::become_group_leader(cache_dir)?;
    buildorc::signals::install_handlers()?;

    let mut cache: Cache = buildorc::jobstore::collect_jobs_into_cache(cache_dir)?;
    let graph = buildorc::scheduler::build_graph(cache_dir, cache.jobs.clone())?;
    let pipelines_opt = if pipelines.is_empty() { None } else { Some(pipelines.as_slice()) };
    let included = buildorc::scheduler::select_subset(&graph, pipelines_opt, stage.as_deref());

    let killer = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let dump_poller = {
        let closure_cache_dir = cache_dir.to_path_buf();
        buildorc::signals::spawn_dump_poller(cache_dir, std::sync::Arc::clone(&killer), move || {
            let cache = buildorc::cachedir::read_cache(&closure_cache_dir)?;
            let doc = buildorc::reporter::build_run_document(&closure_cache_dir, &cache)?;
            Ok(serde_json::to_value(doc)?)
        })
    };
    let reporter_handle = {
        let cache_dir = cache_dir.to_path_buf();
        let killer = std::sync::Arc::clone(&killer);
        let out_file = out_file.clone();
        std::thread::spawn(move || buildorc::reporter::run_loop(&cache_dir, killer, out_file))
    };

    let parallel = config.resolve_parallel(parallel_flag);
    let pools = config.resolve_pools(cache.pools.clone());

    let trace = buildorc::scheduler::run(
        &graph,
        &included,
        buildorc::scheduler::SchedulerOpts {
            cache_dir,
            pools: &pools,
            parallel,
            dry_run,
        },
    )?;
    cache.parallelism = Some(trace);

    buildorc::scheduler::finalize_cache_status(&mut cache, cache_dir)?;
    buildorc::cachedir::write_cache(cache_dir, &cache)?;

    killer.store(true, std::sync::atomic::Ordering::Relaxed);
    let doc = buildorc::reporter::publish_once(cache_dir, out_file.as_deref())?;
    let _ = reporter_handle.join();
    let _ = dump_poller.join();

    if buildorc::signals::termination_requested() {
        buildorc::signals::cascade_to_process_group();
        return Ok(0);
    }

    Response::new("run-build", &doc).print();

    if fail_on_pipeline_failure && doc.status != buildorc::schema::Outcome::Success {
        return Ok(10);
    }
    Ok(0)
}
