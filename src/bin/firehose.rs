//! Streams newline-delimited JSON records through a firehose pipeline.
//!
//! Usage: `firehose <records.jsonl|-> [--job NAME] [--config FILE] [--log-file FILE]`

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::ExitCode;
use std::sync::Arc;

use colored::*;
use firehose::{
    init_logging, CancellationToken, FirehoseConfig, FirehoseError, FirehosePipeline, Record,
};

const USAGE: &str = "usage: firehose <records.jsonl|-> [--job NAME] [--config FILE] [--log-file FILE]";

#[derive(Debug, Default)]
struct Args {
    input: String,
    job: Option<String>,
    config: Option<String>,
    log_file: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().ok_or_else(|| format!("{} needs a value", flag));
        match arg.as_str() {
            "--job" => args.job = Some(value("--job")?),
            "--config" => args.config = Some(value("--config")?),
            "--log-file" => args.log_file = Some(value("--log-file")?),
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if args.input.is_empty() => args.input = other.to_string(),
            other => return Err(format!("unexpected argument '{}'", other)),
        }
    }
    if args.input.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(args)
}

fn run(args: Args) -> firehose::Result<()> {
    init_logging(args.log_file.as_deref())?;

    let config = match &args.config {
        Some(path) => FirehoseConfig::from_json_file(path)?,
        None => FirehoseConfig::default(),
    };
    let mut pipeline = FirehosePipeline::open(Arc::new(config))?;

    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&args.input)?))
    };
    let records = reader
        .lines()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|line| line.map_err(FirehoseError::from).and_then(|l| Record::from_json_str(&l)));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Interrupt received, finishing the current batch");
        on_interrupt.cancel();
    }) {
        log::warn!("Could not install interrupt handler: {}", e);
    }

    let job = args.job.as_deref().unwrap_or("generic_job");
    let summary = pipeline.run(records, job, &cancel)?;
    pipeline.close()?;

    if summary.cancelled {
        println!("{} interrupted, pending records were flushed", "warn:".yellow().bold());
    }

    println!(
        "{} {} records, {} batches ({} failed), {} flushes",
        "done:".green().bold(),
        summary.records_received,
        summary.batches_processed,
        summary.batches_failed,
        summary.flushes
    );
    if summary.producer_errors > 0 {
        println!("{} {} unreadable lines skipped", "warn:".yellow().bold(), summary.producer_errors);
    }
    for file in pipeline.files() {
        println!("  {}", file.display().to_string().cyan());
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
