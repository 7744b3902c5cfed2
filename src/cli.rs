//! Command-line surface: one scriptable verb per pipeline stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use console::style;
use reqwest::Client;
use tracing::warn;

use crate::annotations::{self, AnnotationFile, StoreError};
use crate::config::{ConfigError, Credentials, HostPolicies};
use crate::download::{DownloadCoordinator, ImageWorker};
use crate::filter::{
    self, CommandDetector, CommandScorer, FaceFilter, FilterError, FilterStage, NsfwFilter,
    WordFilter,
};
use crate::net::{self, Fetcher, RateLimiter};
use crate::posts::{HarvestError, Month, PostFetcher};

/// Parses arguments, executes the requested command, and returns the
/// process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {}", style("error:").red().bold(), err.display_message());
            err.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<()> {
    match cli.command {
        Command::DownloadAnns(args) => handle_download_anns(args).await,
        Command::Merge(args) => handle_merge(args),
        Command::DownloadImgs(args) => handle_download_imgs(args).await,
        Command::FilterWords(args) => handle_filter_words(args).await,
        Command::FilterNsfw(args) => handle_filter_nsfw(args).await,
        Command::FilterFaces(args) => handle_filter_faces(args).await,
        Command::Validate(args) => handle_validate(args),
    }
}

#[derive(Parser)]
#[command(
    name = "redharvest",
    version,
    about = "Build image-caption datasets from subreddit posts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one month of post metadata for a subreddit.
    DownloadAnns(DownloadAnnsArgs),
    /// Merge annotation files that share a subreddit.
    Merge(MergeArgs),
    /// Download, decode, and resize the images of an annotation file.
    DownloadImgs(DownloadImgsArgs),
    /// Remove records whose captions contain blocklisted words.
    FilterWords(FilterWordsArgs),
    /// Remove records whose images are flagged NSFW.
    FilterNsfw(FilterNsfwArgs),
    /// Remove records whose images contain detected faces.
    FilterFaces(FilterFacesArgs),
    /// Check an annotation file against its invariants.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct DownloadAnnsArgs {
    #[arg(short, long)]
    subreddit: String,
    /// Month to harvest, as YYYY-MM.
    #[arg(short, long)]
    month: Month,
    #[arg(short, long, default_value = "credentials.toml")]
    credentials: PathBuf,
    /// Directory (or .json path) to save the annotation file.
    #[arg(short = 'o', long, default_value = "datasets/annotations")]
    save_to: PathBuf,
    /// Listing query granularity in hours; busy subreddits are split
    /// further automatically. Must be at most 24.
    #[arg(short = 't', long, default_value_t = 24.0)]
    time_window: f64,
}

#[derive(Args)]
struct MergeArgs {
    /// Annotation files to merge.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(short = 'o', long)]
    save_to: PathBuf,
    /// Delete the input files after a successful merge.
    #[arg(short, long)]
    delete_old: bool,
}

#[derive(Args)]
struct DownloadImgsArgs {
    #[arg(short, long)]
    annotations: PathBuf,
    /// Directory to save images; one sub-directory per subreddit.
    #[arg(short = 'o', long = "save-to", default_value = "datasets/images")]
    save_to: PathBuf,
    /// Resize the shorter edge to this many pixels; -1 disables resizing.
    #[arg(short = 'z', long, default_value_t = 512, allow_negative_numbers = true)]
    resize: i32,
    /// Worker pool size; 0 means one worker per CPU core.
    #[arg(short = 'j', long, default_value_t = 4)]
    workers: usize,
    /// Remove records whose image failed to download.
    #[arg(short, long)]
    update_annotations: bool,
    /// Credentials file; only needed to resolve Imgur album links.
    #[arg(short, long)]
    credentials: Option<PathBuf>,
}

#[derive(Args)]
struct FilterWordsArgs {
    #[arg(short, long)]
    annotations: PathBuf,
    #[arg(short, long, default_value = "datasets/images")]
    images: PathBuf,
    /// Local word list (one word per line); fetched from the canonical
    /// list when omitted.
    #[arg(short, long)]
    wordlist: Option<PathBuf>,
}

#[derive(Args)]
struct FilterNsfwArgs {
    #[arg(short, long)]
    annotations: PathBuf,
    #[arg(short, long, default_value = "datasets/images")]
    images: PathBuf,
    /// Path to the NSFW model weights.
    #[arg(short, long)]
    model: PathBuf,
    /// Inference command fed image bytes on stdin, emitting JSON scores.
    #[arg(long, default_value = "nsfw-inference")]
    runner: PathBuf,
    /// Minimum combined score to flag an image.
    #[arg(short, long, default_value_t = 0.9)]
    threshold: f64,
}

#[derive(Args)]
struct FilterFacesArgs {
    #[arg(short, long)]
    annotations: PathBuf,
    #[arg(short, long, default_value = "datasets/images")]
    images: PathBuf,
    /// Directory where detector weights are cached (auto-fetched).
    #[arg(long, default_value = "datasets/models")]
    model_dir: PathBuf,
    /// Inference command fed image bytes on stdin, emitting JSON boxes.
    #[arg(long, default_value = "face-inference")]
    runner: PathBuf,
    /// Minimum confidence for a face detection to count.
    #[arg(short, long, default_value_t = 0.9)]
    threshold: f64,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(short, long)]
    annotations: PathBuf,
}

#[derive(Debug)]
enum CliError {
    Validation(String),
    Failure(anyhow::Error),
}

type CliResult<T> = Result<T, CliError>;

impl CliError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn failure(error: impl Into<anyhow::Error>) -> Self {
        Self::Failure(error.into())
    }

    const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Failure(_) => 3,
        }
    }

    fn display_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Failure(error) => format!("{error:#}"),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(_) | StoreError::NothingToMerge => {
                Self::Validation(err.to_string())
            }
            other => Self::Failure(other.into()),
        }
    }
}

impl From<FilterError> for CliError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Store(store) => store.into(),
            other => Self::Failure(other.into()),
        }
    }
}

fn default_user_agent() -> String {
    format!("redharvest/{}", env!("CARGO_PKG_VERSION"))
}

fn build_fetcher(user_agent: &str) -> CliResult<(Client, Arc<Fetcher>)> {
    let client = net::build_client(user_agent)
        .map_err(|e| CliError::failure(anyhow!("failed to build HTTP client: {e}")))?;
    let limiter = Arc::new(RateLimiter::new(HostPolicies::default()));
    Ok((client.clone(), Arc::new(Fetcher::new(client, limiter))))
}

async fn handle_download_anns(args: DownloadAnnsArgs) -> CliResult<()> {
    let credentials = Credentials::load(&args.credentials).map_err(|e| match e {
        ConfigError::Credential(message) => CliError::validation(message),
        other => CliError::failure(other),
    })?;
    if !credentials.has_valid_reddit() {
        return Err(CliError::validation(format!(
            "reddit credentials in {} are placeholders; fill in your API keys",
            args.credentials.display()
        )));
    }

    println!(
        "{}",
        style(format!("Downloading posts from r/{}, {}", args.subreddit, args.month))
    );

    let (client, fetcher) = build_fetcher(&credentials.reddit.user_agent)?;
    let harvester = PostFetcher::new(client, fetcher, credentials);
    let file = harvester
        .harvest(&args.subreddit, args.month, args.time_window)
        .await
        .map_err(|e| match e {
            HarvestError::Credential(_) | HarvestError::Window(_) => {
                CliError::validation(e.to_string())
            }
            other => CliError::failure(other),
        })?;

    let output = annotation_output_path(&args.save_to, &args.subreddit, args.month);
    let count = file.annotations.len();
    file.save(&output)?;

    println!(
        "{}",
        style(format!(
            "[{}] Saved {count} annotations at {}",
            args.month,
            output.display()
        ))
        .green()
    );
    Ok(())
}

/// `--save-to` may be a .json path or a directory; directories get the
/// conventional `<subreddit>_<YYYY-MM>.json` name.
fn annotation_output_path(save_to: &Path, subreddit: &str, month: Month) -> PathBuf {
    if save_to.extension().is_some_and(|ext| ext == "json") {
        save_to.to_path_buf()
    } else {
        save_to.join(format!("{}_{}.json", subreddit.to_lowercase(), month))
    }
}

fn handle_merge(args: MergeArgs) -> CliResult<()> {
    let outcome = annotations::merge(&args.files)?;

    if args.delete_old && outcome.inputs_filtered > 0 {
        return Err(CliError::validation(format!(
            "refusing --delete-old: {} input file(s) carry filter info that the merged file will not preserve",
            outcome.inputs_filtered
        )));
    }
    if outcome.inputs_filtered > 0 {
        println!(
            "{}",
            style(format!(
                "{} input file(s) were already filtered; their filter info is not carried over",
                outcome.inputs_filtered
            ))
            .yellow()
        );
    }

    let count = outcome.file.annotations.len();
    outcome.file.save(&args.save_to)?;
    println!(
        "{}",
        style(format!("Saved {count} merged annotations at {}", args.save_to.display())).green()
    );

    if args.delete_old {
        let target = std::fs::canonicalize(&args.save_to).unwrap_or(args.save_to.clone());
        for input in &args.files {
            let resolved = std::fs::canonicalize(input).unwrap_or(input.clone());
            // The merged file may be saved over one of its inputs.
            if resolved != target {
                std::fs::remove_file(input)
                    .map_err(|e| CliError::failure(anyhow!("failed to delete {}: {e}", input.display())))?;
                println!("{}", style(format!("Deleted {}", input.display())).red());
            }
        }
    }
    Ok(())
}

async fn handle_download_imgs(args: DownloadImgsArgs) -> CliResult<()> {
    let imgur_client_id = match &args.credentials {
        Some(path) => {
            let credentials = Credentials::load(path).map_err(|e| match e {
                ConfigError::Credential(message) => CliError::validation(message),
                other => CliError::failure(other),
            })?;
            credentials
                .has_valid_imgur()
                .then(|| credentials.imgur.client_id.clone())
        }
        None => None,
    };

    let workers = if args.workers == 0 { num_cpus::get() } else { args.workers };
    let (_, fetcher) = build_fetcher(&default_user_agent())?;
    let worker = Arc::new(ImageWorker::new(
        fetcher,
        args.save_to.clone(),
        args.resize,
        imgur_client_id,
    ));
    let coordinator = DownloadCoordinator::new(worker, workers, args.update_annotations);

    // Stop spawning on ctrl-c; in-flight fetches finish or time out, and
    // the batch write is abandoned rather than left partial.
    let cancel = coordinator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, winding down");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let stats = coordinator
        .run(&args.annotations)
        .await
        .map_err(|e| CliError::failure(anyhow!(e)))?;

    println!(
        "{}",
        style(format!(
            "Downloaded {}/{} images from {} (skipped {}, failed {}, dropped {})",
            stats.downloaded,
            stats.total,
            args.annotations.display(),
            stats.skipped,
            stats.failed,
            stats.dropped,
        ))
        .green()
    );
    Ok(())
}

async fn handle_filter_words(args: FilterWordsArgs) -> CliResult<()> {
    let stage = match &args.wordlist {
        Some(path) => WordFilter::from_file(path)?,
        None => {
            let client = net::build_client(&default_user_agent())
                .map_err(|e| CliError::failure(anyhow!("failed to build HTTP client: {e}")))?;
            WordFilter::fetch_default(&client).await?
        }
    };

    run_filter(&args.annotations, &args.images, &stage).await
}

async fn handle_filter_nsfw(args: FilterNsfwArgs) -> CliResult<()> {
    if !args.model.exists() {
        return Err(CliError::validation(format!(
            "NSFW model weights not found at {}",
            args.model.display()
        )));
    }

    let scorer = CommandScorer::new(&args.runner, &args.model);
    let stage = NsfwFilter::new(Box::new(scorer), args.threshold);
    run_filter(&args.annotations, &args.images, &stage).await
}

async fn handle_filter_faces(args: FilterFacesArgs) -> CliResult<()> {
    let client = net::build_client(&default_user_agent())
        .map_err(|e| CliError::failure(anyhow!("failed to build HTTP client: {e}")))?;
    let model = filter::faces::ensure_model(&client, &args.model_dir).await?;

    let detector = CommandDetector::new(&args.runner, model);
    let stage = FaceFilter::new(Box::new(detector), args.threshold);
    run_filter(&args.annotations, &args.images, &stage).await
}

async fn run_filter(
    annotations: &Path,
    images: &Path,
    stage: &dyn FilterStage,
) -> CliResult<()> {
    let outcome = filter::run_stage(annotations, images, stage).await?;

    if outcome.already_filtered {
        println!(
            "{}",
            style(format!(
                "{} has already been {}-filtered.",
                annotations.display(),
                stage.name()
            ))
            .red()
        );
        return Ok(());
    }

    println!(
        "{}",
        style(format!(
            "Removed {} of {} examined records; updated {}",
            outcome.removed,
            outcome.examined,
            annotations.display()
        ))
        .green()
    );
    Ok(())
}

fn handle_validate(args: ValidateArgs) -> CliResult<()> {
    println!("{}", style(format!("Validating {}...", args.annotations.display())));
    let file = AnnotationFile::load(&args.annotations)?;

    for (marker, command) in [
        (&file.info.word_filter, "filter-words"),
        (&file.info.nsfw_filter, "filter-nsfw"),
        (&file.info.face_filter, "filter-faces"),
    ] {
        if marker.is_none() {
            println!(
                "{}",
                style(format!("{command} has not run on this file yet")).yellow()
            );
        }
    }

    let errors = file.validate();
    for error in &errors {
        println!("{}", style(error).red());
    }

    if errors.is_empty() {
        println!("{}", style("File is valid.").green());
        Ok(())
    } else {
        Err(CliError::validation(format!(
            "{} validation error(s) in {}",
            errors.len(),
            args.annotations.display()
        )))
    }
}
