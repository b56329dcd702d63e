use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "hou2ue-gate",
    version,
    about = "Guarded stage runner and ground-truth gate for the Houdini to Unreal pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Exec(ExecArgs),
    Capture(CaptureArgs),
    Compare(CompareArgs),
    SetupDiff(SetupDiffArgs),
    Report(ReportArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long)]
    pub config: PathBuf,

    #[arg(long, value_parser = ["smoke", "full"], default_value = "full")]
    pub profile: String,

    #[arg(long)]
    pub run_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long)]
    pub stage: String,

    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CaptureKind {
    Reference,
    Source,
}

impl CaptureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Source => "source",
        }
    }

    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Reference => "gt_reference_capture",
            Self::Source => "gt_source_capture",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, value_enum)]
    pub kind: CaptureKind,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SetupDiffArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long)]
    pub reference: PathBuf,

    #[arg(long)]
    pub current: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub run_dir: PathBuf,
}
