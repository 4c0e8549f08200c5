//! Offline inspection of GBPTree files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use gbptree::storage::btree::{describe_file, layout_id, overwrite_header, read_header, FileInfo};
use gbptree::{CheckSummary, CollectingVisitor, Finding, GbpTree, GbpTreeOptions, KeyCodec, ValCodec};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gbptree-inspect",
    version,
    about = "Inspect and verify GBPTree index files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show format metadata and the current tree state.
    Info {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Print the header blob stored with the tree, or replace it.
    Header {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, value_name = "TEXT", help = "Replace the header with this text")]
        set: Option<String>,
    },
    /// Walk the whole tree and report structural problems.
    Check {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(
            long,
            default_value_t = 64,
            help = "Stop after this many findings (0 reports all)"
        )]
        max_findings: usize,

        #[arg(long, help = "Report an unclean previous shutdown as a finding")]
        report_dirty: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(serde::Serialize)]
struct CheckReport {
    layout: &'static str,
    summary: CheckSummary,
    findings: Vec<Finding>,
    truncated: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Info { path } => {
            let info = describe_file(&path)?;
            emit(cli.format, &info, || print_info_text(&path, &info))
        }
        Command::Header { path, set } => {
            if let Some(text) = set {
                overwrite_header(&path, text.as_bytes())?;
            }
            let header = read_header(&path)?;
            emit(cli.format, &header, || print_header_text(&header))
        }
        Command::Check {
            path,
            max_findings,
            report_dirty,
        } => {
            let info = describe_file(&path)?;
            let options = CheckOptions {
                max_findings,
                report_dirty,
            };
            let report = check_any(&path, info.meta.layout_id, options)?;
            emit(cli.format, &report, || print_check_text(&report))?;
            if report.findings.is_empty() {
                Ok(())
            } else {
                Err(format!("{} finding(s)", report.findings.len()).into())
            }
        }
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(),
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct CheckOptions {
    max_findings: usize,
    report_dirty: bool,
}

/// Opens the file with the codec pair whose layout id matches and runs the
/// consistency check.
fn check_any(path: &Path, layout: u64, options: CheckOptions) -> Result<CheckReport, Box<dyn Error>> {
    macro_rules! try_layout {
        ($($name:literal => ($k:ty, $v:ty)),+ $(,)?) => {
            $(
                if layout == layout_id::<$k, $v>() {
                    return check_with::<$k, $v>(path, $name, options);
                }
            )+
        };
    }
    try_layout! {
        "u64 -> u64" => (u64, u64),
        "u64 -> i64" => (u64, i64),
        "u64 -> bytes" => (u64, Vec<u8>),
        "u64 -> ()" => (u64, ()),
        "i64 -> i64" => (i64, i64),
        "i64 -> u64" => (i64, u64),
        "i64 -> bytes" => (i64, Vec<u8>),
        "i64 -> ()" => (i64, ()),
        "bytes -> bytes" => (Vec<u8>, Vec<u8>),
        "bytes -> u64" => (Vec<u8>, u64),
        "bytes -> ()" => (Vec<u8>, ()),
        "string -> string" => (String, String),
        "string -> u64" => (String, u64),
        "string -> ()" => (String, ()),
    }
    Err(format!("no built-in codec pair matches layout {layout:#018x}").into())
}

fn check_with<K: KeyCodec, V: ValCodec>(
    path: &Path,
    layout: &'static str,
    options: CheckOptions,
) -> Result<CheckReport, Box<dyn Error>> {
    let max_findings = options.max_findings;
    let tree: GbpTree<K, V> = GbpTree::open(
        path,
        GbpTreeOptions {
            read_only: true,
            create_if_missing: false,
            ..GbpTreeOptions::default()
        },
    )?;
    let mut collected = CollectingVisitor::default();
    let mut truncated = false;
    let mut visitor = |finding: &Finding| {
        if max_findings != 0 && collected.findings.len() >= max_findings {
            truncated = true;
            return std::ops::ControlFlow::Break(());
        }
        collected.findings.push(finding.clone());
        std::ops::ControlFlow::Continue(())
    };
    let summary = tree.consistency_check_with(&mut visitor, options.report_dirty)?;
    tree.close()?;
    Ok(CheckReport {
        layout,
        summary,
        findings: collected.findings,
        truncated,
    })
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<24} {value}");
}

fn print_info_text(path: &Path, info: &FileInfo) {
    println!("{}", path.display());
    print_field("format", format!("{}.{}", info.meta.format_major, info.meta.format_minor));
    print_field("page size", info.meta.page_size);
    print_field("layout", format!("{:#018x}", info.meta.layout_id));
    print_field("node format", format!("{:?}", info.meta.node_format));
    print_field("state page", info.state_page);
    print_field("state version", info.state_version);
    print_field(
        "generations",
        format!("{}/{}", info.generations.stable, info.generations.unstable),
    );
    print_field("root", format!("{} (gen {})", info.root, info.root_generation));
    print_field("last page id", info.last_id);
    print_field("clean shutdown", info.clean);
    print_field("header bytes", info.header_len);
}

fn print_header_text(header: &[u8]) {
    match std::str::from_utf8(header) {
        Ok(text) => println!("{text}"),
        Err(_) => {
            for chunk in header.chunks(16) {
                let line: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{}", line.join(" "));
            }
        }
    }
}

fn print_check_text(report: &CheckReport) {
    let summary = &report.summary;
    println!(
        "Checked {} layout: depth={} nodes={} leaves={} entries={} root_keys={}",
        report.layout, summary.depth, summary.nodes, summary.leaves, summary.entries, summary.root_keys
    );
    if report.findings.is_empty() {
        println!("No findings.");
        return;
    }
    for finding in &report.findings {
        println!("  {finding:?}");
    }
    if report.truncated {
        println!("  ... more findings suppressed");
    }
}
