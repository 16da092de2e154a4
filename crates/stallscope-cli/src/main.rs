use std::path::Path;

use facet::Facet;
use figue as args;
use stallscope_analysis::{
    AnalysisOptions, CompositeResult, CorrelationContext, JsonTraceFile, Severity,
    registry_without,
};
use stallscope_types::Snapshot;
use tracing::{debug, info};

/// Composite severity at or above which the process exits with [`EXIT_PROBLEMS`].
const FAILING_SEVERITY: Severity = Severity::Error;
const EXIT_PROBLEMS: i32 = 2;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Snapshot JSON files, one snapshot per file.
    #[facet(args::positional, default)]
    snapshots: Vec<String>,
    /// Profiling trace JSON file.
    #[facet(args::named, default)]
    trace: Option<String>,
    /// Print the composite result as JSON.
    #[facet(args::named, default)]
    json: bool,
    /// Comma-separated analyzer names to run, in order.
    #[facet(args::named, default)]
    only: Option<String>,
    /// Comma-separated analyzer names to leave out.
    #[facet(args::named, default)]
    skip: Option<String>,
    #[facet(args::named, default)]
    include_daemon: bool,
    #[facet(args::named, default)]
    include_gc: bool,
    #[facet(args::named, default)]
    include_vm: bool,
    /// Regex; matching thread names are left out.
    #[facet(args::named, default)]
    ignore: Vec<String>,
    /// Regex; only matching thread names are analyzed.
    #[facet(args::named, default)]
    focus: Vec<String>,
    /// Snapshots a thread must be seen in before it can count as stalled.
    #[facet(args::named, default)]
    stall_threshold: Option<usize>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if cli.snapshots.is_empty() {
        return Err("no snapshot files given".to_string());
    }

    let options = options_from_cli(&cli)?;
    let snapshots = read_snapshots(&cli.snapshots)?;
    let ctx = match &cli.trace {
        Some(path) => {
            CorrelationContext::with_trace(snapshots, Box::new(JsonTraceFile::new(path)), options)
        }
        None => CorrelationContext::new(snapshots, options),
    }
    .map_err(|e| e.to_string())?;

    let skip = split_list(cli.skip.as_deref());
    let engine = registry_without(&skip);
    let only = split_list(cli.only.as_deref());
    let composite = if only.is_empty() {
        engine.analyze_all(&ctx)
    } else {
        engine.analyze_named(&ctx, &only)
    };
    info!(
        analyzers = composite.results.len(),
        findings = composite.findings.len(),
        severity = %composite.severity,
        "analysis complete"
    );

    if cli.json {
        let json = facet_json::to_string_pretty(&composite)
            .map_err(|e| format!("encode result: {e}"))?;
        println!("{json}");
    } else {
        print!("{}", render_text(&composite));
    }

    Ok(exit_code(composite.severity))
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("stallscope")
                .description("Diagnose stalls and deadlocks from thread-dump snapshots")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn options_from_cli(cli: &Cli) -> Result<AnalysisOptions, String> {
    let mut builder = AnalysisOptions::builder()
        .include_daemon(cli.include_daemon)
        .include_gc(cli.include_gc)
        .include_vm(cli.include_vm);
    for pattern in &cli.ignore {
        builder = builder.ignore(pattern.as_str());
    }
    for pattern in &cli.focus {
        builder = builder.focus(pattern.as_str());
    }
    if let Some(threshold) = cli.stall_threshold {
        builder = builder.min_dumps_for_stall(threshold);
    }
    builder.build().map_err(|e| e.to_string())
}

/// Snapshots come back ordered by capture time, whatever the argument order.
fn read_snapshots(paths: &[String]) -> Result<Vec<Snapshot>, String> {
    let mut snapshots = paths
        .iter()
        .map(|path| read_snapshot(Path::new(path)))
        .collect::<Result<Vec<_>, _>>()?;
    snapshots.sort_by_key(|s| s.timestamp_ms);
    Ok(snapshots)
}

fn read_snapshot(path: &Path) -> Result<Snapshot, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let mut snapshot: Snapshot = facet_json::from_str(&text)
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
    if snapshot.source.is_none() {
        snapshot.source = Some(path.display().to_string());
    }
    debug!(
        path = %path.display(),
        threads = snapshot.threads.len(),
        timestamp_ms = snapshot.timestamp_ms,
        "loaded snapshot"
    );
    Ok(snapshot)
}

fn split_list(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn exit_code(severity: Severity) -> i32 {
    if severity >= FAILING_SEVERITY {
        EXIT_PROBLEMS
    } else {
        0
    }
}

fn render_text(composite: &CompositeResult) -> String {
    let mut out = String::new();
    for result in &composite.results {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            result.severity,
            result.analyzer,
            result.summary()
        ));
        for finding in &result.findings {
            out.push_str(&format!(
                "    {} {}: {}\n",
                finding.severity, finding.category, finding.message
            ));
            if !finding.affected_threads.is_empty() {
                out.push_str(&format!(
                    "      threads: {}\n",
                    finding.affected_threads.join(", ")
                ));
            }
        }
    }
    out.push_str(&format!("\n{}\n", composite.summary()));
    out
}

#[cfg(test)]
mod tests {
    use stallscope_analysis::{AnalysisResult, Finding};
    use stallscope_analysis::result::{ErrorReport, ResultPayload};

    use super::*;

    #[test]
    fn lists_are_trimmed_and_skip_empty_entries() {
        assert_eq!(split_list(Some("verdict, deadlock,,")), vec!["verdict", "deadlock"]);
        assert!(split_list(None).is_empty());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(Severity::Ok), 0);
        assert_eq!(exit_code(Severity::Warning), 0);
        assert_eq!(exit_code(Severity::Error), 2);
        assert_eq!(exit_code(Severity::Critical), 2);
    }

    #[test]
    fn text_lists_findings_under_their_analyzer() {
        let finding = Finding::builder(Severity::Warning, "pool-blocked", "3 blocked")
            .affected_threads(["a", "b"])
            .build();
        let result = AnalysisResult::from_findings(
            "thread-pool",
            vec![finding],
            ResultPayload::Error(ErrorReport {
                message: "x".to_string(),
            }),
        );
        let text = render_text(&CompositeResult::new(vec![result]));
        assert!(text.starts_with("[WARNING] thread-pool: Error: x\n"));
        assert!(text.contains("    WARNING pool-blocked: 3 blocked\n      threads: a, b\n"));
        assert!(text.ends_with("1 analyzers, 1 findings, severity WARNING\n"));
    }
}
